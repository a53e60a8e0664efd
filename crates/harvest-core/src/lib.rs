//! Core record model, deterministic identity and field normalization for the harvester.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

mod fields;
mod identity;

pub use fields::{
    content_hash, domain_metadata_triples, Column, ColumnValue, DomainMetadata, DomainTriple,
    FieldKind, FieldValues, Language, NormalizedValue, Rejection, Scope, ValueTable,
    LATITUDE_RANGE, LONGITUDE_RANGE, RECORD_ID_COLUMN,
};
pub use identity::{normalize_pub_date, record_uuid, resolve_item_url};

pub const CRATE_NAME: &str = "harvest-core";

/// A JSON scalar or list; adapters are free to emit either for multi-valued fields.
///
/// `Many` is tried first so a list is never mistaken for a struct in sequence form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values,
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<OneOrMany<T>>::deserialize(deserializer)?.map(OneOrMany::into_vec))
}

fn first_of_one_or_many<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(one_or_many::<D, String>(deserializer)?.and_then(|values| values.into_iter().next()))
}

/// Latitude/longitude as emitted by sources: sometimes numeric, sometimes text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Coordinate {
    Number(f64),
    Text(String),
}

impl Coordinate {
    pub fn to_f64(&self) -> Option<f64> {
        let value = match self {
            Self::Number(n) => *n,
            Self::Text(t) => t.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }

    pub fn raw(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(t) => t.clone(),
        }
    }
}

impl From<f64> for Coordinate {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for Coordinate {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Institution a record's creators belong to, optionally with a registry identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Affiliation {
    Name(String),
    Detailed {
        #[serde(default)]
        affiliation_name: String,
        #[serde(default)]
        affiliation_ror: Option<String>,
    },
}

impl Affiliation {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Detailed {
                affiliation_name, ..
            } => affiliation_name,
        }
    }

    pub fn ror(&self) -> Option<&str> {
        match self {
            Self::Name(_) => None,
            Self::Detailed {
                affiliation_ror, ..
            } => affiliation_ror.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoPlace {
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub province_state: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub other: Option<String>,
    #[serde(default)]
    pub place_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(default)]
    pub lat: Option<Coordinate>,
    #[serde(default)]
    pub lon: Option<Coordinate>,
}

impl GeoPoint {
    pub fn new(lat: impl Into<Coordinate>, lon: impl Into<Coordinate>) -> Self {
        Self {
            lat: Some(lat.into()),
            lon: Some(lon.into()),
        }
    }
}

/// Bounding box; any single bound may be missing and is mirrored from its opposite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoBbox {
    #[serde(default, rename = "westLon")]
    pub west_lon: Option<Coordinate>,
    #[serde(default, rename = "eastLon")]
    pub east_lon: Option<Coordinate>,
    #[serde(default, rename = "northLat")]
    pub north_lat: Option<Coordinate>,
    #[serde(default, rename = "southLat")]
    pub south_lat: Option<Coordinate>,
}

impl GeoBbox {
    pub fn new(west: f64, east: f64, north: f64, south: f64) -> Self {
        Self {
            west_lon: Some(west.into()),
            east_lon: Some(east.into()),
            north_lat: Some(north.into()),
            south_lat: Some(south.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoFile {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

/// Canadian Research and Development Classification entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdcEntry {
    pub crdc_code: Option<String>,
    pub crdc_group_en: Option<String>,
    pub crdc_group_fr: Option<String>,
    pub crdc_class_en: Option<String>,
    pub crdc_class_fr: Option<String>,
    pub crdc_field_en: Option<String>,
    pub crdc_field_fr: Option<String>,
}

/// Normalized handoff contract from repository adapters into the store.
///
/// Multi-valued fields are `None` when the source did not report the field at
/// all; reconciliation treats that as "remove every stored value".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarvestRecord {
    pub identifier: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub title_fr: String,
    #[serde(default)]
    pub pub_date: String,
    #[serde(default)]
    pub series: String,
    /// Total bytes of the dataset's files, `0` when the source does not report it.
    #[serde(default)]
    pub files_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_url: Option<String>,
    #[serde(
        default,
        alias = "dc:source",
        deserialize_with = "first_of_one_or_many",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_url: Option<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub creator: Option<Vec<String>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub contributor: Option<Vec<String>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub publisher: Option<Vec<String>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<Vec<Affiliation>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub access: Option<Vec<String>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub rights: Option<Vec<String>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub tags_fr: Option<Vec<String>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub subject: Option<Vec<String>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub subject_fr: Option<Vec<String>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub description: Option<Vec<String>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub description_fr: Option<Vec<String>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub geoplaces: Option<Vec<GeoPlace>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub geopoints: Option<Vec<GeoPoint>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub geobboxes: Option<Vec<GeoBbox>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub geofiles: Option<Vec<GeoFile>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub crdc: Option<Vec<CrdcEntry>>,
    /// `namespace#field_name` → one or many values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_metadata: Option<BTreeMap<String, OneOrMany<String>>>,
}

impl HarvestRecord {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    pub fn has_title(&self) -> bool {
        !self.title.trim().is_empty() || !self.title_fr.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_and_list_fields_both_deserialize_to_lists() {
        let record: HarvestRecord = serde_json::from_str(
            r#"{
                "identifier": "oai:example.org:42",
                "title": "Ocean temperatures",
                "creator": "Smith, J.",
                "tags": ["climate", "ocean"],
                "dc:source": ["https://example.org/42", "https://mirror.example.org/42"],
                "geopoints": {"lat": "45.5", "lon": -73.6}
            }"#,
        )
        .expect("record parses");

        assert_eq!(record.creator, Some(vec!["Smith, J.".to_string()]));
        assert_eq!(
            record.tags,
            Some(vec!["climate".to_string(), "ocean".to_string()])
        );
        assert_eq!(record.source_url.as_deref(), Some("https://example.org/42"));
        assert_eq!(record.contributor, None);
        let points = record.geopoints.expect("points");
        assert_eq!(points[0].lat.as_ref().and_then(Coordinate::to_f64), Some(45.5));
        assert_eq!(points[0].lon.as_ref().and_then(Coordinate::to_f64), Some(-73.6));
    }

    #[test]
    fn affiliations_accept_bare_names_and_registry_objects() {
        let record: HarvestRecord = serde_json::from_str(
            r#"{
                "identifier": "x",
                "affiliation": [
                    "University of Somewhere",
                    {"affiliation_name": "Institute", "affiliation_ror": "https://ror.org/0abc"}
                ]
            }"#,
        )
        .expect("record parses");
        let affiliations = record.affiliation.expect("affiliations");
        assert_eq!(affiliations[0].name(), "University of Somewhere");
        assert_eq!(affiliations[0].ror(), None);
        assert_eq!(affiliations[1].name(), "Institute");
        assert_eq!(affiliations[1].ror(), Some("https://ror.org/0abc"));
    }

    #[test]
    fn domain_metadata_values_may_be_scalar_or_list() {
        let record: HarvestRecord = serde_json::from_str(
            r#"{
                "identifier": "x",
                "domain_metadata": {
                    "https://schema.example/ocean#depth": "200m",
                    "https://schema.example/ocean#instrument": ["CTD", "ADCP"]
                }
            }"#,
        )
        .expect("record parses");
        let metadata = record.domain_metadata.expect("metadata");
        assert_eq!(
            metadata["https://schema.example/ocean#depth"].as_slice(),
            ["200m".to_string()]
        );
        assert_eq!(
            metadata["https://schema.example/ocean#instrument"].as_slice().len(),
            2
        );
    }

    #[test]
    fn two_bare_affiliation_names_stay_two_values() {
        let record: HarvestRecord = serde_json::from_str(
            r#"{"identifier": "x", "affiliation": ["Université Laval", "McGill University"]}"#,
        )
        .expect("record parses");
        let affiliations = record.affiliation.expect("affiliations");
        assert_eq!(affiliations.len(), 2);
        assert_eq!(affiliations[1].name(), "McGill University");
    }

    #[test]
    fn coordinate_text_must_be_numeric_and_finite() {
        assert_eq!(Coordinate::from(" 12.5 ").to_f64(), Some(12.5));
        assert_eq!(Coordinate::from("north").to_f64(), None);
        assert_eq!(Coordinate::from(f64::NAN).to_f64(), None);
    }
}

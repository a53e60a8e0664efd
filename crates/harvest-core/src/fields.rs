//! Value-table catalogue and per-field normalization rules.
//!
//! Every multi-valued field of a [`HarvestRecord`] is described by one
//! [`FieldKind`] variant. The variant knows which value table backs it, how the
//! record's current associations are scoped (language, contributor role) and
//! how an incoming value becomes the canonical key columns used for lookup.
//! Nothing here touches storage.

use std::ops::RangeInclusive;

use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::{Coordinate, CrdcEntry, GeoBbox, GeoFile, GeoPlace, GeoPoint, HarvestRecord};

/// Column holding the owning record id, on association rows and record-scoped value rows.
pub const RECORD_ID_COLUMN: &str = "record_uuid";

pub const LATITUDE_RANGE: RangeInclusive<f64> = -90.0..=90.0;
pub const LONGITUDE_RANGE: RangeInclusive<f64> = -180.0..=180.0;

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(String),
    Real(f64),
    Integer(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: &'static str,
    pub value: ColumnValue,
}

impl Column {
    pub fn text(name: &'static str, value: impl Into<String>) -> Self {
        Self {
            name,
            value: ColumnValue::Text(value.into()),
        }
    }

    pub fn real(name: &'static str, value: f64) -> Self {
        Self {
            name,
            value: ColumnValue::Real(value),
        }
    }

    pub fn integer(name: &'static str, value: i64) -> Self {
        Self {
            name,
            value: ColumnValue::Integer(value),
        }
    }
}

/// Canonical form of one incoming value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedValue {
    /// Columns identifying the value row. Used for lookup and written on insert.
    pub key: Vec<Column>,
    /// Columns written on insert only (original text next to its hash, CRDC labels).
    pub payload: Vec<Column>,
    /// Attributes stored on the association row.
    pub edge: Vec<Column>,
}

impl NormalizedValue {
    fn keyed(key: Vec<Column>) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    fn with_payload(mut self, payload: Vec<Column>) -> Self {
        self.payload = payload;
        self
    }

    fn with_edge(mut self, edge: Vec<Column>) -> Self {
        self.edge = edge;
        self
    }
}

/// Restricts which of a record's associations belong to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    /// Filter on a column of the value row.
    Value(Column),
    /// Filter on a column of the association row.
    Link(Column),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    En,
    Fr,
}

impl Language {
    pub fn code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Fr => "fr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueTable {
    Creators,
    Publishers,
    Affiliations,
    Access,
    Rights,
    Tags,
    Subjects,
    GeoPlaces,
    Descriptions,
    GeoBboxes,
    GeoPoints,
    GeoFiles,
    Crdc,
    DomainSchemas,
    DomainMetadata,
}

impl ValueTable {
    pub const ALL: [ValueTable; 15] = [
        ValueTable::Creators,
        ValueTable::Publishers,
        ValueTable::Affiliations,
        ValueTable::Access,
        ValueTable::Rights,
        ValueTable::Tags,
        ValueTable::Subjects,
        ValueTable::GeoPlaces,
        ValueTable::Descriptions,
        ValueTable::GeoBboxes,
        ValueTable::GeoPoints,
        ValueTable::GeoFiles,
        ValueTable::Crdc,
        ValueTable::DomainSchemas,
        ValueTable::DomainMetadata,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Creators => "creators",
            Self::Publishers => "publishers",
            Self::Affiliations => "affiliations",
            Self::Access => "access",
            Self::Rights => "rights",
            Self::Tags => "tags",
            Self::Subjects => "subjects",
            Self::GeoPlaces => "geoplace",
            Self::Descriptions => "descriptions",
            Self::GeoBboxes => "geobbox",
            Self::GeoPoints => "geopoint",
            Self::GeoFiles => "geofile",
            Self::Crdc => "crdc",
            Self::DomainSchemas => "domain_schemas",
            Self::DomainMetadata => "domain_metadata",
        }
    }

    pub const fn id_column(self) -> &'static str {
        match self {
            Self::Creators => "creator_id",
            Self::Publishers => "publisher_id",
            Self::Affiliations => "affiliation_id",
            Self::Access => "access_id",
            Self::Rights => "rights_id",
            Self::Tags => "tag_id",
            Self::Subjects => "subject_id",
            Self::GeoPlaces => "geoplace_id",
            Self::Descriptions => "description_id",
            Self::GeoBboxes => "geobbox_id",
            Self::GeoPoints => "geopoint_id",
            Self::GeoFiles => "geofile_id",
            Self::Crdc => "crdc_id",
            Self::DomainSchemas => "schema_id",
            Self::DomainMetadata => "metadata_id",
        }
    }

    /// Association table for shared values; `None` for record-scoped and lookup-only tables.
    pub const fn crosstable(self) -> Option<&'static str> {
        match self {
            Self::Creators => Some("records_x_creators"),
            Self::Publishers => Some("records_x_publishers"),
            Self::Affiliations => Some("records_x_affiliations"),
            Self::Access => Some("records_x_access"),
            Self::Rights => Some("records_x_rights"),
            Self::Tags => Some("records_x_tags"),
            Self::Subjects => Some("records_x_subjects"),
            Self::GeoPlaces => Some("records_x_geoplace"),
            Self::Crdc => Some("records_x_crdc"),
            Self::Descriptions
            | Self::GeoBboxes
            | Self::GeoPoints
            | Self::GeoFiles
            | Self::DomainSchemas
            | Self::DomainMetadata => None,
        }
    }

    /// Rows carry their owning record id and die with their association.
    pub const fn is_record_scoped(self) -> bool {
        matches!(
            self,
            Self::Descriptions
                | Self::GeoBboxes
                | Self::GeoPoints
                | Self::GeoFiles
                | Self::DomainMetadata
        )
    }

    /// Shared rows whose payload columns are rewritten when a source reports new labels.
    pub const fn refreshes_payload(self) -> bool {
        matches!(self, Self::Crdc)
    }
}

/// Why an incoming value was dropped. Never fatal to the record.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("{field}: missing {component}")]
    Missing {
        field: &'static str,
        component: &'static str,
    },
    #[error("{field}: unparseable {component} {raw:?}")]
    Unparseable {
        field: &'static str,
        component: &'static str,
        raw: String,
    },
    #[error("{field}: latitude {value} outside [-90, 90]")]
    LatitudeOutOfRange { field: &'static str, value: f64 },
    #[error("{field}: longitude {value} outside [-180, 180]")]
    LongitudeOutOfRange { field: &'static str, value: f64 },
    #[error("domain metadata key {0:?} has no namespace separator")]
    MalformedDomainKey(String),
}

/// Normalized values of one field that is present on the incoming record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldValues {
    pub values: Vec<NormalizedValue>,
    pub rejected: Vec<Rejection>,
}

impl FieldValues {
    fn collect<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Result<Option<NormalizedValue>, Rejection>>,
    {
        let mut out = Self::default();
        for result in results {
            match result {
                Ok(Some(value)) => out.values.push(value),
                Ok(None) => {}
                Err(rejection) => out.rejected.push(rejection),
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Creator,
    Contributor,
    Publisher,
    Affiliation,
    Access,
    Rights,
    Tags(Language),
    Subjects(Language),
    GeoPlaces,
    Descriptions(Language),
    GeoBboxes,
    GeoPoints,
    GeoFiles,
    Crdc,
}

impl FieldKind {
    /// Reconciliation order.
    pub const ALL: [FieldKind; 17] = [
        FieldKind::Creator,
        FieldKind::Contributor,
        FieldKind::Publisher,
        FieldKind::Affiliation,
        FieldKind::Access,
        FieldKind::Rights,
        FieldKind::Tags(Language::En),
        FieldKind::Tags(Language::Fr),
        FieldKind::Subjects(Language::En),
        FieldKind::Subjects(Language::Fr),
        FieldKind::GeoPlaces,
        FieldKind::Descriptions(Language::En),
        FieldKind::Descriptions(Language::Fr),
        FieldKind::GeoBboxes,
        FieldKind::GeoPoints,
        FieldKind::GeoFiles,
        FieldKind::Crdc,
    ];

    /// Key of the field in the adapter record.
    pub fn field_name(self) -> &'static str {
        match self {
            Self::Creator => "creator",
            Self::Contributor => "contributor",
            Self::Publisher => "publisher",
            Self::Affiliation => "affiliation",
            Self::Access => "access",
            Self::Rights => "rights",
            Self::Tags(Language::En) => "tags",
            Self::Tags(Language::Fr) => "tags_fr",
            Self::Subjects(Language::En) => "subject",
            Self::Subjects(Language::Fr) => "subject_fr",
            Self::GeoPlaces => "geoplaces",
            Self::Descriptions(Language::En) => "description",
            Self::Descriptions(Language::Fr) => "description_fr",
            Self::GeoBboxes => "geobboxes",
            Self::GeoPoints => "geopoints",
            Self::GeoFiles => "geofiles",
            Self::Crdc => "crdc",
        }
    }

    pub fn table(self) -> ValueTable {
        match self {
            Self::Creator | Self::Contributor => ValueTable::Creators,
            Self::Publisher => ValueTable::Publishers,
            Self::Affiliation => ValueTable::Affiliations,
            Self::Access => ValueTable::Access,
            Self::Rights => ValueTable::Rights,
            Self::Tags(_) => ValueTable::Tags,
            Self::Subjects(_) => ValueTable::Subjects,
            Self::GeoPlaces => ValueTable::GeoPlaces,
            Self::Descriptions(_) => ValueTable::Descriptions,
            Self::GeoBboxes => ValueTable::GeoBboxes,
            Self::GeoPoints => ValueTable::GeoPoints,
            Self::GeoFiles => ValueTable::GeoFiles,
            Self::Crdc => ValueTable::Crdc,
        }
    }

    pub fn scope(self) -> Option<Scope> {
        match self {
            Self::Creator => Some(Scope::Link(contributor_flag(false))),
            Self::Contributor => Some(Scope::Link(contributor_flag(true))),
            Self::Tags(lang) | Self::Subjects(lang) | Self::Descriptions(lang) => {
                Some(Scope::Value(Column::text("language", lang.code())))
            }
            _ => None,
        }
    }

    /// Canonical values of this field, or `None` when the record does not carry it.
    pub fn normalize(self, record: &HarvestRecord, record_id: Uuid) -> Option<FieldValues> {
        let owner = record_id.to_string();
        match self {
            Self::Creator => record.creator.as_deref().map(|v| creators(v, false)),
            Self::Contributor => record.contributor.as_deref().map(|v| creators(v, true)),
            Self::Publisher => record.publisher.as_deref().map(|v| literals(v, "publisher")),
            Self::Access => record.access.as_deref().map(|v| literals(v, "access")),
            Self::Affiliation => record.affiliation.as_deref().map(|values| {
                FieldValues::collect(values.iter().map(|a| Ok(affiliation(a.name(), a.ror()))))
            }),
            Self::Rights => record.rights.as_deref().map(|values| {
                FieldValues::collect(values.iter().map(|text| Ok(rights(text))))
            }),
            Self::Tags(lang) => language_field(&record.tags, &record.tags_fr, lang)
                .map(|v| labelled(v, "tag", lang)),
            Self::Subjects(lang) => language_field(&record.subject, &record.subject_fr, lang)
                .map(|v| labelled(v, "subject", lang)),
            Self::Descriptions(lang) => {
                language_field(&record.description, &record.description_fr, lang).map(|values| {
                    FieldValues::collect(values.iter().map(|text| Ok(description(text, lang, &owner))))
                })
            }
            Self::GeoPlaces => record.geoplaces.as_deref().map(|values| {
                FieldValues::collect(values.iter().map(|p| Ok(geo_place(p))))
            }),
            Self::GeoBboxes => record.geobboxes.as_deref().map(|values| {
                FieldValues::collect(values.iter().map(|b| geo_bbox(b, &owner)))
            }),
            Self::GeoPoints => {
                let collapsed = collapsed_bbox_points(record);
                if record.geopoints.is_none() && collapsed.is_empty() {
                    return None;
                }
                let declared = record
                    .geopoints
                    .iter()
                    .flatten()
                    .map(|p| geo_point(p, &owner));
                let redirected = collapsed
                    .into_iter()
                    .map(|(lat, lon)| Ok(Some(point_value(lat, lon, &owner))));
                Some(FieldValues::collect(declared.chain(redirected)))
            }
            Self::GeoFiles => record.geofiles.as_deref().map(|values| {
                FieldValues::collect(values.iter().map(|f| geo_file(f, &owner)))
            }),
            Self::Crdc => record
                .crdc
                .as_deref()
                .map(|values| FieldValues::collect(values.iter().map(crdc))),
        }
    }
}

fn contributor_flag(is_contributor: bool) -> Column {
    Column::integer("is_contributor", i64::from(is_contributor))
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

fn language_field<'a>(
    en: &'a Option<Vec<String>>,
    fr: &'a Option<Vec<String>>,
    lang: Language,
) -> Option<&'a [String]> {
    match lang {
        Language::En => en.as_deref(),
        Language::Fr => fr.as_deref(),
    }
}

fn literals(values: &[String], column: &'static str) -> FieldValues {
    FieldValues::collect(values.iter().map(|v| {
        Ok(non_empty(v).map(|v| NormalizedValue::keyed(vec![Column::text(column, v)])))
    }))
}

fn creators(values: &[String], is_contributor: bool) -> FieldValues {
    let mut out = literals(values, "creator");
    out.values = out
        .values
        .into_iter()
        .map(|v| v.with_edge(vec![contributor_flag(is_contributor)]))
        .collect();
    out
}

fn labelled(values: &[String], column: &'static str, lang: Language) -> FieldValues {
    FieldValues::collect(values.iter().map(|v| {
        Ok(non_empty(v).map(|v| {
            NormalizedValue::keyed(vec![
                Column::text(column, v),
                Column::text("language", lang.code()),
            ])
        }))
    }))
}

fn affiliation(name: &str, ror: Option<&str>) -> Option<NormalizedValue> {
    non_empty(name).map(|name| {
        NormalizedValue::keyed(vec![
            Column::text("affiliation", name),
            Column::text("affiliation_ror", ror.unwrap_or_default()),
        ])
    })
}

fn rights(text: &str) -> Option<NormalizedValue> {
    non_empty(text).map(|text| {
        NormalizedValue::keyed(vec![Column::text("rights_hash", content_hash(text))])
            .with_payload(vec![Column::text("rights", text)])
    })
}

fn description(text: &str, lang: Language, owner: &str) -> Option<NormalizedValue> {
    non_empty(text).map(|text| {
        NormalizedValue::keyed(vec![
            Column::text(RECORD_ID_COLUMN, owner),
            Column::text("description_hash", content_hash(text)),
            Column::text("language", lang.code()),
        ])
        .with_payload(vec![Column::text("description", text)])
    })
}

fn geo_place(place: &GeoPlace) -> Option<NormalizedValue> {
    let part = |v: &Option<String>| v.clone().unwrap_or_default();
    let columns = vec![
        Column::text("place_name", part(&place.place_name)),
        Column::text("country", part(&place.country)),
        Column::text("province_state", part(&place.province_state)),
        Column::text("city", part(&place.city)),
        Column::text("other", part(&place.other)),
    ];
    let blank = columns
        .iter()
        .all(|c| matches!(&c.value, ColumnValue::Text(t) if t.is_empty()));
    (!blank).then(|| NormalizedValue::keyed(columns))
}

fn latitude(
    field: &'static str,
    component: &'static str,
    raw: Option<&Coordinate>,
) -> Result<f64, Rejection> {
    let value = coordinate(field, component, raw)?;
    if LATITUDE_RANGE.contains(&value) {
        Ok(value)
    } else {
        Err(Rejection::LatitudeOutOfRange { field, value })
    }
}

fn longitude(
    field: &'static str,
    component: &'static str,
    raw: Option<&Coordinate>,
) -> Result<f64, Rejection> {
    let value = coordinate(field, component, raw)?;
    if LONGITUDE_RANGE.contains(&value) {
        Ok(value)
    } else {
        Err(Rejection::LongitudeOutOfRange { field, value })
    }
}

fn coordinate(
    field: &'static str,
    component: &'static str,
    raw: Option<&Coordinate>,
) -> Result<f64, Rejection> {
    let raw = raw.ok_or(Rejection::Missing { field, component })?;
    raw.to_f64().ok_or_else(|| Rejection::Unparseable {
        field,
        component,
        raw: raw.raw(),
    })
}

fn point_value(lat: f64, lon: f64, owner: &str) -> NormalizedValue {
    NormalizedValue::keyed(vec![
        Column::text(RECORD_ID_COLUMN, owner),
        Column::real("lat", lat),
        Column::real("lon", lon),
    ])
}

fn geo_point(point: &GeoPoint, owner: &str) -> Result<Option<NormalizedValue>, Rejection> {
    let lat = latitude("geopoints", "lat", point.lat.as_ref())?;
    let lon = longitude("geopoints", "lon", point.lon.as_ref())?;
    Ok(Some(point_value(lat, lon, owner)))
}

enum BboxShape {
    Box {
        west: f64,
        east: f64,
        north: f64,
        south: f64,
    },
    Point {
        lat: f64,
        lon: f64,
    },
}

fn resolve_bbox(bbox: &GeoBbox) -> Result<BboxShape, Rejection> {
    const FIELD: &str = "geobboxes";
    let west_raw = bbox.west_lon.as_ref().or(bbox.east_lon.as_ref());
    let east_raw = bbox.east_lon.as_ref().or(bbox.west_lon.as_ref());
    let north_raw = bbox.north_lat.as_ref().or(bbox.south_lat.as_ref());
    let south_raw = bbox.south_lat.as_ref().or(bbox.north_lat.as_ref());

    let north = latitude(FIELD, "northLat", north_raw)?;
    let south = latitude(FIELD, "southLat", south_raw)?;
    let west = longitude(FIELD, "westLon", west_raw)?;
    let east = longitude(FIELD, "eastLon", east_raw)?;

    if west == east && north == south {
        Ok(BboxShape::Point {
            lat: north,
            lon: west,
        })
    } else {
        Ok(BboxShape::Box {
            west,
            east,
            north,
            south,
        })
    }
}

fn geo_bbox(bbox: &GeoBbox, owner: &str) -> Result<Option<NormalizedValue>, Rejection> {
    match resolve_bbox(bbox)? {
        BboxShape::Box {
            west,
            east,
            north,
            south,
        } => Ok(Some(NormalizedValue::keyed(vec![
            Column::text(RECORD_ID_COLUMN, owner),
            Column::real("west_lon", west),
            Column::real("east_lon", east),
            Column::real("north_lat", north),
            Column::real("south_lat", south),
        ]))),
        // Collapsed boxes are stored through the geo-point field.
        BboxShape::Point { .. } => Ok(None),
    }
}

/// Zero-area boxes of the record, re-expressed as (lat, lon) points.
fn collapsed_bbox_points(record: &HarvestRecord) -> Vec<(f64, f64)> {
    record
        .geobboxes
        .iter()
        .flatten()
        .filter_map(|b| match resolve_bbox(b) {
            Ok(BboxShape::Point { lat, lon }) => Some((lat, lon)),
            _ => None,
        })
        .collect()
}

fn geo_file(file: &GeoFile, owner: &str) -> Result<Option<NormalizedValue>, Rejection> {
    const FIELD: &str = "geofiles";
    let filename = file
        .filename
        .as_deref()
        .and_then(non_empty)
        .ok_or(Rejection::Missing {
            field: FIELD,
            component: "filename",
        })?;
    let uri = file.uri.as_deref().and_then(non_empty).ok_or(Rejection::Missing {
        field: FIELD,
        component: "uri",
    })?;
    Ok(Some(NormalizedValue::keyed(vec![
        Column::text(RECORD_ID_COLUMN, owner),
        Column::text("filename", filename),
        Column::text("uri", uri),
    ])))
}

fn crdc(entry: &CrdcEntry) -> Result<Option<NormalizedValue>, Rejection> {
    let required = |component: &'static str, value: &Option<String>| {
        value.clone().ok_or(Rejection::Missing {
            field: "crdc",
            component,
        })
    };
    let code = required("crdc_code", &entry.crdc_code)?;
    let payload = vec![
        Column::text("crdc_group_en", required("crdc_group_en", &entry.crdc_group_en)?),
        Column::text("crdc_group_fr", required("crdc_group_fr", &entry.crdc_group_fr)?),
        Column::text("crdc_class_en", required("crdc_class_en", &entry.crdc_class_en)?),
        Column::text("crdc_class_fr", required("crdc_class_fr", &entry.crdc_class_fr)?),
        Column::text("crdc_field_en", required("crdc_field_en", &entry.crdc_field_en)?),
        Column::text("crdc_field_fr", required("crdc_field_fr", &entry.crdc_field_fr)?),
    ];
    Ok(non_empty(&code).map(|code| {
        NormalizedValue::keyed(vec![Column::text("crdc_code", code)]).with_payload(payload)
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainTriple {
    pub namespace: String,
    pub field_name: String,
    pub field_value: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainMetadata {
    pub triples: Vec<DomainTriple>,
    pub rejected: Vec<Rejection>,
}

/// Splits `namespace#field_name` keys into triples; `None` when the record has no domain metadata.
pub fn domain_metadata_triples(record: &HarvestRecord) -> Option<DomainMetadata> {
    let metadata = record.domain_metadata.as_ref()?;
    let mut out = DomainMetadata::default();
    for (key, values) in metadata {
        let Some((namespace, field_name)) = key.split_once('#') else {
            out.rejected.push(Rejection::MalformedDomainKey(key.clone()));
            continue;
        };
        for value in values.as_slice().iter().filter(|v| !v.is_empty()) {
            out.triples.push(DomainTriple {
                namespace: namespace.to_string(),
                field_name: field_name.to_string(),
                field_value: value.clone(),
            });
        }
    }
    Some(out)
}

impl DomainTriple {
    /// Canonical row for this triple once its namespace has a `domain_schemas` id.
    pub fn normalized(&self, schema_id: i64, record_id: Uuid) -> NormalizedValue {
        NormalizedValue::keyed(vec![
            Column::text(RECORD_ID_COLUMN, record_id.to_string()),
            Column::integer("schema_id", schema_id),
            Column::text("field_name", self.field_name.clone()),
            Column::text("field_value", self.field_value.clone()),
        ])
    }

    pub fn schema_key(&self) -> Vec<Column> {
        vec![Column::text("namespace", self.namespace.clone())]
    }
}

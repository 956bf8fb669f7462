//! Detection records as the client sees them.
//!
//! Every payload the backend sends is decoded into the `*Wire` structs and
//! normalized exactly once. The backend renames some fields between
//! endpoints, stores booleans as integers and sometimes sends `null` where a
//! number is expected; after `DetectionRecord::from_wire` /
//! `RecordDetail::from_wire` downstream code (stats, sync, report) works on
//! plain values and never re-applies defaults.

use chrono::{DateTime, NaiveDateTime};
use serde::de::{Deserializer, IgnoredAny};
use serde::{Deserialize, Serialize};
use url::Url;

pub type RecordId = u64;

/// Record as sent by `GET /api/registros` and inside the detail envelope.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RecordWire {
    #[serde(deserialize_with = "lenient_id")]
    pub id: Option<RecordId>,
    #[serde(alias = "fecha_hora", deserialize_with = "lenient_text")]
    pub timestamp: Option<String>,
    #[serde(deserialize_with = "lenient_number")]
    pub total_personas: Option<f64>,
    #[serde(alias = "cumplimiento_casco", deserialize_with = "lenient_number")]
    pub cumplimiento_cascos: Option<f64>,
    #[serde(alias = "cumplimiento_chaleco", deserialize_with = "lenient_number")]
    pub cumplimiento_chalecos: Option<f64>,
    #[serde(deserialize_with = "lenient_number")]
    pub cumplimiento_gafas: Option<f64>,
    #[serde(deserialize_with = "lenient_number")]
    pub cumplimiento_general: Option<f64>,
    #[serde(deserialize_with = "lenient_text")]
    pub ruta_imagen: Option<String>,
}

/// One entry of the detail's `detecciones` array.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PersonWire {
    #[serde(alias = "id", deserialize_with = "lenient_number")]
    pub numero_persona: Option<f64>,
    #[serde(deserialize_with = "lenient_flag")]
    pub tiene_casco: bool,
    #[serde(deserialize_with = "lenient_flag")]
    pub tiene_chaleco: bool,
    #[serde(deserialize_with = "lenient_flag")]
    pub tiene_gafas: bool,
}

/// `{"registros": [...]}`
#[derive(Debug, Deserialize)]
pub struct ListEnvelope {
    pub registros: Vec<RecordWire>,
}

/// `{"registro": {...}, "detecciones": [...]}`
#[derive(Debug, Deserialize)]
pub struct DetailEnvelope {
    pub registro: RecordWire,
    #[serde(default)]
    pub detecciones: Vec<PersonWire>,
}

/// One observation event, owned by the backend.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub id: RecordId,
    /// Raw timestamp text as reported; see [`format_timestamp`].
    pub timestamp: Option<String>,
    pub total_personas: u32,
    pub cumplimiento_cascos: f64,
    pub cumplimiento_chalecos: f64,
    pub cumplimiento_gafas: f64,
    /// Reported independently by the backend; not the mean of the categories.
    pub cumplimiento_general: f64,
    pub ruta_imagen: Option<String>,
}

impl DetectionRecord {
    /// Normalizes one wire record. Returns `None` when the record carries no
    /// usable id, since nothing can address it afterwards.
    pub fn from_wire(wire: RecordWire) -> Option<Self> {
        Some(Self {
            id: wire.id?,
            timestamp: wire.timestamp,
            total_personas: count(wire.total_personas),
            cumplimiento_cascos: percent(wire.cumplimiento_cascos),
            cumplimiento_chalecos: percent(wire.cumplimiento_chalecos),
            cumplimiento_gafas: percent(wire.cumplimiento_gafas),
            cumplimiento_general: percent(wire.cumplimiento_general),
            ruta_imagen: wire.ruta_imagen,
        })
    }

    /// Resolves the evidence image against the backend base URL.
    pub fn evidence(&self, base: &Url) -> EvidenceImage {
        let Some(raw) = self.ruta_imagen.as_deref() else {
            return EvidenceImage::Placeholder { reference: None };
        };
        let path = normalize_image_path(raw);
        let placeholder = || EvidenceImage::Placeholder {
            reference: Some(raw.to_string()),
        };
        if path.is_empty() || has_drive_or_scheme(&path) {
            return placeholder();
        }
        match base.join(&path) {
            Ok(url) => EvidenceImage::Remote(url),
            Err(err) => {
                log::debug!("evidence path '{}' not joinable: {}", raw, err);
                placeholder()
            }
        }
    }
}

/// Normalizes a batch of wire records, keeping the backend's order.
pub fn normalize_records(wire: Vec<RecordWire>) -> Vec<DetectionRecord> {
    wire.into_iter()
        .filter_map(|item| {
            let record = DetectionRecord::from_wire(item);
            if record.is_none() {
                log::warn!("dropping detection record without a usable id");
            }
            record
        })
        .collect()
}

/// Per-person breakdown returned by the detail endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PersonDetection {
    pub numero_persona: u32,
    pub tiene_casco: bool,
    pub tiene_chaleco: bool,
    pub tiene_gafas: bool,
    /// Synthesized locally because the backend did not report this person.
    pub placeholder: bool,
}

impl PersonDetection {
    /// `ordinal` numbers the person when the backend sent no usable number.
    pub fn from_wire(wire: PersonWire, ordinal: u32) -> Self {
        let numero = wire
            .numero_persona
            .filter(|n| *n >= 1.0)
            .map(|n| n.min(u32::MAX as f64) as u32)
            .unwrap_or(ordinal);
        Self {
            numero_persona: numero,
            tiene_casco: wire.tiene_casco,
            tiene_chaleco: wire.tiene_chaleco,
            tiene_gafas: wire.tiene_gafas,
            placeholder: false,
        }
    }

    pub fn placeholder(numero_persona: u32) -> Self {
        Self {
            numero_persona,
            tiene_casco: false,
            tiene_chaleco: false,
            tiene_gafas: false,
            placeholder: true,
        }
    }
}

/// Builds exactly `total_personas` persons from the ones the backend
/// reported.
///
/// Missing persons are padded with placeholders (all EPP false) and surplus
/// entries beyond `total_personas` are dropped.
pub fn reconcile_persons(
    total_personas: u32,
    reported: Vec<PersonDetection>,
) -> Vec<PersonDetection> {
    let total = total_personas as usize;
    if reported.len() != total {
        log::debug!(
            "detail reports {} persons but carries {} detections",
            total,
            reported.len()
        );
    }
    let mut persons = reported;
    persons.truncate(total);
    let mut next = persons.iter().map(|p| p.numero_persona).max().unwrap_or(0);
    while persons.len() < total {
        next += 1;
        persons.push(PersonDetection::placeholder(next));
    }
    persons
}

/// A record plus its per-person breakdown.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordDetail {
    pub record: DetectionRecord,
    pub persons: Vec<PersonDetection>,
}

impl RecordDetail {
    pub fn from_wire(envelope: DetailEnvelope) -> Result<Self, String> {
        let record = DetectionRecord::from_wire(envelope.registro)
            .ok_or_else(|| "detail payload has no usable 'registro'".to_string())?;
        let reported = envelope
            .detecciones
            .into_iter()
            .zip(1u32..)
            .map(|(wire, ordinal)| PersonDetection::from_wire(wire, ordinal))
            .collect();
        let persons = reconcile_persons(record.total_personas, reported);
        Ok(Self { record, persons })
    }

    pub fn synthesized_persons(&self) -> usize {
        self.persons.iter().filter(|p| p.placeholder).count()
    }
}

/// Where an evidence image can be loaded from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvidenceImage {
    Remote(Url),
    Placeholder { reference: Option<String> },
}

impl EvidenceImage {
    /// The image could not be loaded; show the placeholder instead.
    pub fn fallback(self) -> Self {
        match self {
            EvidenceImage::Remote(url) => EvidenceImage::Placeholder {
                reference: Some(url.to_string()),
            },
            placeholder => placeholder,
        }
    }
}

/// Converts host-platform separators to URL separators and strips leading
/// `./` and `/` so the path joins relative to the backend base URL.
pub fn normalize_image_path(raw: &str) -> String {
    let mut path = raw.trim().replace('\\', "/");
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest.to_string();
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest.to_string();
        } else {
            break;
        }
    }
    path
}

fn has_drive_or_scheme(path: &str) -> bool {
    let head = path.split('/').next().unwrap_or("");
    head.contains(':')
}

/// Renders a record timestamp for display.
pub fn format_timestamp(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return "Sin fecha".to_string();
    };
    match parse_timestamp(raw) {
        Some(ts) => ts.format("%d/%m/%Y, %I:%M:%S %p").to_string(),
        None => "Fecha inválida".to_string(),
    }
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_local());
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

fn percent(value: Option<f64>) -> f64 {
    value.unwrap_or(0.0).clamp(0.0, 100.0)
}

fn count(value: Option<f64>) -> u32 {
    value
        .map(|n| n.max(0.0).min(u32::MAX as f64) as u32)
        .unwrap_or(0)
}

/// Any JSON scalar; whatever else shows up is skipped.
#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Flag(bool),
    Number(f64),
    Text(String),
    Other(IgnoredAny),
}

fn lenient_number<'de, D: Deserializer<'de>>(de: D) -> Result<Option<f64>, D::Error> {
    let n = match Loose::deserialize(de)? {
        Loose::Number(n) => Some(n),
        Loose::Text(s) => s.trim().parse::<f64>().ok(),
        Loose::Flag(_) | Loose::Other(_) => None,
    };
    Ok(n.filter(|n| n.is_finite()))
}

fn lenient_id<'de, D: Deserializer<'de>>(de: D) -> Result<Option<RecordId>, D::Error> {
    Ok(match Loose::deserialize(de)? {
        Loose::Number(n) if n >= 0.0 && n.fract() == 0.0 => Some(n as RecordId),
        Loose::Text(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_text<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(match Loose::deserialize(de)? {
        Loose::Text(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    })
}

// sqlite hands booleans back as 0/1
fn lenient_flag<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    Ok(match Loose::deserialize(de)? {
        Loose::Flag(b) => b,
        Loose::Number(n) => n != 0.0,
        Loose::Text(s) => matches!(s.trim(), "1" | "true" | "True"),
        Loose::Other(_) => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire_record(value: serde_json::Value) -> Option<DetectionRecord> {
        DetectionRecord::from_wire(serde_json::from_value(value).expect("record wire"))
    }

    fn wire_detail(value: serde_json::Value) -> Result<RecordDetail, String> {
        RecordDetail::from_wire(serde_json::from_value(value).expect("detail wire"))
    }

    #[test]
    fn normalizes_aliased_and_missing_fields() {
        let record = wire_record(json!({
            "id": 7,
            "fecha_hora": "2026-10-18T14:03:09",
            "total_personas": 3,
            "cumplimiento_casco": 66.7,
            "cumplimiento_chalecos": null,
            "cumplimiento_gafas": 140,
            "cumplimiento_general": "50.5",
            "ruta_imagen": ""
        }))
        .expect("record");

        assert_eq!(record.id, 7);
        assert_eq!(record.timestamp.as_deref(), Some("2026-10-18T14:03:09"));
        assert_eq!(record.total_personas, 3);
        assert_eq!(record.cumplimiento_cascos, 66.7);
        assert_eq!(record.cumplimiento_chalecos, 0.0);
        assert_eq!(record.cumplimiento_gafas, 100.0);
        assert_eq!(record.cumplimiento_general, 50.5);
        assert_eq!(record.ruta_imagen, None);
    }

    #[test]
    fn drops_records_without_id() {
        let envelope: ListEnvelope = serde_json::from_value(json!({"registros": [
            {"id": 2, "total_personas": 1},
            {"total_personas": 4},
            {"id": "1", "total_personas": -3},
            {"id": null, "total_personas": 2}
        ]}))
        .expect("list wire");
        let records = normalize_records(envelope.registros);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 2);
        assert_eq!(records[1].id, 1);
        assert_eq!(records[1].total_personas, 0);
    }

    #[test]
    fn synthesizes_placeholders_when_detections_absent() {
        let detail = wire_detail(json!({
            "registro": {"id": 4, "total_personas": 3},
            "detecciones": []
        }))
        .expect("detail");

        assert_eq!(detail.persons.len(), 3);
        assert_eq!(detail.synthesized_persons(), 3);
        for (person, expected) in detail.persons.iter().zip(1u32..) {
            assert_eq!(person.numero_persona, expected);
            assert!(!person.tiene_casco && !person.tiene_chaleco && !person.tiene_gafas);
        }
    }

    #[test]
    fn pads_short_detection_lists_and_reads_integer_flags() {
        let detail = wire_detail(json!({
            "registro": {"id": 9, "total_personas": 3},
            "detecciones": [
                {"numero_persona": 1, "tiene_casco": 1, "tiene_chaleco": 0, "tiene_gafas": true}
            ]
        }))
        .expect("detail");
        let persons = &detail.persons;
        assert_eq!(persons.len(), 3);
        assert!(persons[0].tiene_casco);
        assert!(!persons[0].tiene_chaleco);
        assert!(persons[0].tiene_gafas);
        assert!(!persons[0].placeholder);
        assert_eq!(persons[1], PersonDetection::placeholder(2));
        assert_eq!(persons[2], PersonDetection::placeholder(3));
    }

    #[test]
    fn truncates_surplus_detections() {
        let detail = wire_detail(json!({
            "registro": {"id": 9, "total_personas": 1},
            "detecciones": [{}, {"numero_persona": 9}]
        }))
        .expect("detail");
        assert_eq!(detail.persons.len(), 1);
        assert_eq!(detail.persons[0].numero_persona, 1);
    }

    #[test]
    fn detail_without_record_id_is_rejected() {
        assert!(wire_detail(json!({"registro": {"total_personas": 1}})).is_err());
    }

    #[test]
    fn evidence_paths_are_normalized() {
        let base = Url::parse("http://127.0.0.1:8000").unwrap();
        let mut record = wire_record(json!({"id": 1})).unwrap();
        assert_eq!(
            record.evidence(&base),
            EvidenceImage::Placeholder { reference: None }
        );

        record.ruta_imagen = Some(r"registros\frame_0001.jpg".to_string());
        assert_eq!(
            record.evidence(&base),
            EvidenceImage::Remote(
                Url::parse("http://127.0.0.1:8000/registros/frame_0001.jpg").unwrap()
            )
        );

        record.ruta_imagen = Some(r"C:\epp\registros\frame_0001.jpg".to_string());
        assert!(matches!(
            record.evidence(&base),
            EvidenceImage::Placeholder { reference: Some(_) }
        ));
    }

    #[test]
    fn failed_image_load_falls_back_to_placeholder() {
        let url = Url::parse("http://127.0.0.1:8000/registros/a.jpg").unwrap();
        assert_eq!(
            EvidenceImage::Remote(url).fallback(),
            EvidenceImage::Placeholder {
                reference: Some("http://127.0.0.1:8000/registros/a.jpg".to_string())
            }
        );
    }

    #[test]
    fn formats_timestamps_defensively() {
        assert_eq!(format_timestamp(None), "Sin fecha");
        assert_eq!(format_timestamp(Some("  ")), "Sin fecha");
        assert_eq!(format_timestamp(Some("yesterday")), "Fecha inválida");
        assert_eq!(
            format_timestamp(Some("2026-10-18T14:03:09.250")),
            "18/10/2026, 02:03:09 PM"
        );
        assert_eq!(
            format_timestamp(Some("2026-10-18 09:00:00")),
            "18/10/2026, 09:00:00 AM"
        );
    }
}

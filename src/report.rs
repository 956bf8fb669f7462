//! Plain-text views of the dashboard for the CLI.

use std::fmt::Write;
use url::Url;

use crate::record::{format_timestamp, DetectionRecord, EvidenceImage, RecordDetail};
use crate::session::SessionView;
use crate::stats::{classify_compliance, rate_compliance, AggregateStats, Series};

pub fn render_session(view: &SessionView) -> String {
    let mut out = format!(
        "cámara: {} ({})",
        view.state.as_str(),
        if view.active { "activa" } else { "inactiva" }
    );
    if view.busy {
        out.push_str(", operación en curso");
    }
    if let Some(err) = &view.last_error {
        let _ = write!(out, "\núltimo error: {err}");
    }
    out
}

pub fn render_overview(stats: &AggregateStats, series: &Series) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Registros:          {}", stats.total_registros);
    let _ = writeln!(out, "Personas totales:   {}", stats.total_personas);
    let _ = writeln!(
        out,
        "Personas por frame: min {} / max {}",
        stats.min_personas, stats.max_personas
    );
    let _ = writeln!(
        out,
        "Cumplimiento medio: {} ({})",
        percent(stats.avg_cumplimiento),
        rate_compliance(stats.avg_cumplimiento).label()
    );
    let categories = [
        ("Cascos", stats.cumplimiento.cascos, stats.incumplimientos.cascos),
        ("Chalecos", stats.cumplimiento.chalecos, stats.incumplimientos.chalecos),
        ("Gafas", stats.cumplimiento.gafas, stats.incumplimientos.gafas),
    ];
    for (name, pct, misses) in categories {
        let _ = writeln!(
            out,
            "  {:<9} {:>7} [{}]  incumplimientos: {}",
            name,
            percent(pct),
            classify_compliance(pct).as_str(),
            misses
        );
    }
    let _ = writeln!(
        out,
        "Incumplimientos (peor categoría): {}",
        stats.incumplimientos.total
    );
    match series {
        Series::InsufficientData { available } => {
            let _ = writeln!(
                out,
                "Tendencia: datos insuficientes ({available} registro(s))"
            );
        }
        Series::Points(points) => {
            let trend: Vec<String> = points
                .iter()
                .map(|p| format!("{:.0}", p.cumplimiento_general))
                .collect();
            let _ = writeln!(
                out,
                "Tendencia ({} registros, antiguo → reciente): {}",
                points.len(),
                trend.join(" ")
            );
        }
    }
    out
}

pub fn render_records(records: &[DetectionRecord]) -> String {
    if records.is_empty() {
        return "No hay registros disponibles\n".to_string();
    }
    let mut out = format!(
        "{:>6}  {:<24}  {:>8}  {:>7}  {:>7}  {:>7}  {:>7}  {:<8}  {}\n",
        "ID", "Fecha", "Personas", "Casco", "Chaleco", "Gafas", "General", "Nivel", "Calificación"
    );
    for record in records {
        let _ = writeln!(
            out,
            "{:>6}  {:<24}  {:>8}  {:>7}  {:>7}  {:>7}  {:>7}  {:<8}  {}",
            record.id,
            format_timestamp(record.timestamp.as_deref()),
            record.total_personas,
            percent(record.cumplimiento_cascos),
            percent(record.cumplimiento_chalecos),
            percent(record.cumplimiento_gafas),
            percent(record.cumplimiento_general),
            classify_compliance(record.cumplimiento_general).as_str(),
            rate_compliance(record.cumplimiento_general).label()
        );
    }
    out
}

pub fn render_detail(detail: &RecordDetail, base: &Url) -> String {
    let record = &detail.record;
    let mut out = String::new();
    let _ = writeln!(out, "Registro #{}", record.id);
    let _ = writeln!(out, "Fecha:    {}", format_timestamp(record.timestamp.as_deref()));
    let _ = writeln!(out, "Personas: {}", record.total_personas);
    let _ = writeln!(
        out,
        "General:  {} [{}] {}",
        percent(record.cumplimiento_general),
        classify_compliance(record.cumplimiento_general).as_str(),
        rate_compliance(record.cumplimiento_general).label()
    );
    match record.evidence(base) {
        EvidenceImage::Remote(url) => {
            let _ = writeln!(out, "Evidencia: {url}");
        }
        EvidenceImage::Placeholder { reference: None } => {
            let _ = writeln!(out, "Evidencia: imagen no disponible");
        }
        EvidenceImage::Placeholder {
            reference: Some(raw),
        } => {
            let _ = writeln!(out, "Evidencia: imagen no disponible ({raw})");
        }
    }
    if detail.persons.is_empty() {
        let _ = writeln!(out, "Sin personas detectadas");
        return out;
    }
    for person in &detail.persons {
        let _ = write!(
            out,
            "  Persona {}: casco {}  chaleco {}  gafas {}",
            person.numero_persona,
            mark(person.tiene_casco),
            mark(person.tiene_chaleco),
            mark(person.tiene_gafas)
        );
        if person.placeholder {
            out.push_str("  (sin datos de detección)");
        }
        out.push('\n');
    }
    let synthesized = detail.synthesized_persons();
    if synthesized > 0 {
        let _ = writeln!(
            out,
            "{synthesized} persona(s) sin detalle reportado por el backend"
        );
    }
    out
}

fn percent(value: f64) -> String {
    format!("{value:.1}%")
}

fn mark(present: bool) -> &'static str {
    if present {
        "✓"
    } else {
        "✗"
    }
}

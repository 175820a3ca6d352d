//! Output adapters for a finished run.
//!
//! - `PlanAid Apts <date>.kml`: one placemark per mappable airport, styled by marker
//! - `PlanAid_Airports.txt`: tab-separated summary (ICAO, PinColor, RunwayLength, Comments)
//!
//! Both are written atomically into the output directory.

use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::helpers::{opt_dec_to_f64, write_atomic_file};
use crate::models::{Category, Marker};
use crate::services::pipeline::{ClassifiedAirport, RunReport};

const SUMMARY_FILE: &str = "PlanAid_Airports.txt";
const SUMMARY_HEADER: &str = "ICAO\tPinColor\tRunwayLength\tComments";

/// Icon base for Google Earth's built-in pins.
const ICON_BASE: &str = "http://maps.google.com/mapfiles/kml";

/// Version pin, placed in the Gulf of Mexico outside the planning area.
const VERSION_PIN_COORDS: &str = "-95.62,27.84,0";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("IO error writing export: {0}")]
    Io(#[from] std::io::Error),
    #[error("XML writing error: {0}")]
    Xml(String),
}

/// Map markers that get a KML style (hidden airports are never drawn).
const STYLED_MARKERS: [Marker; 5] = [
    Marker::Green,
    Marker::Blue,
    Marker::Yellow,
    Marker::RedDiamond,
    Marker::RedCircle,
];

fn icon_href(marker: Marker) -> Option<String> {
    let icon = match marker {
        Marker::Green => "pushpin/grn-pushpin.png",
        Marker::Blue => "pushpin/blue-pushpin.png",
        Marker::Yellow => "pushpin/ylw-pushpin.png",
        Marker::RedDiamond => "paddle/red-diamond.png",
        Marker::RedCircle => "paddle/red-circle.png",
        Marker::Hidden => return None,
    };
    Some(format!("{}/{}", ICON_BASE, icon))
}

/// Airports that appear on the map.
///
/// Eligible airports with coordinates, plus category 1 airports (drawn as a
/// red circle so planners see them). Blacklisted airports and airports failing
/// the landing distance gate are omitted.
pub fn is_mapped(airport: &ClassifiedAirport) -> bool {
    let r = &airport.record;
    if !r.has_coordinates() || r.is_blacklisted() || airport.classification.marker == Marker::Hidden {
        return false;
    }
    airport.classification.verdict.is_eligible() || r.category == Category::One
}

pub fn kml_filename(report: &RunReport) -> String {
    format!("PlanAid Apts {}.kml", report.as_of.format("%d %b %Y"))
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), ExportError> {
    writer
        .write_event(event)
        .map_err(|e| ExportError::Xml(e.to_string()))
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), ExportError> {
    emit(writer, Event::Start(BytesStart::new(name)))?;
    emit(writer, Event::Text(BytesText::new(text)))?;
    emit(writer, Event::End(BytesEnd::new(name)))
}

fn description(airport: &ClassifiedAirport) -> String {
    let r = &airport.record;
    let mut lines = vec![r.id.to_string()];
    lines.extend(airport.classification.reasons.iter().cloned());
    if let Some(lda) = r.lda_ft {
        lines.push(format!("Longest landing distance available: {} ft", lda));
    }
    let long_ends: Vec<String> = r
        .runways
        .iter()
        .filter(|e| e.lda_ft >= 7000)
        .map(|e| format!("{} ({}): {}", e.runway_id, e.end_id, e.lda_ft))
        .collect();
    if !long_ends.is_empty() {
        lines.push(format!("Runway ends with declared LDA ≥ 7000: {}", long_ends.join(", ")));
    }
    // A literal "]]>" would end the CDATA section early; split it across two.
    lines.join("<br/>").replace("]]>", "]]]]><![CDATA[>")
}

fn placemark(writer: &mut Writer<Vec<u8>>, airport: &ClassifiedAirport) -> Result<(), ExportError> {
    let r = &airport.record;
    let (Some(lat), Some(lon)) = (opt_dec_to_f64(r.latitude), opt_dec_to_f64(r.longitude)) else {
        return Ok(());
    };
    let name = match r.lda_ft {
        Some(lda) => format!("{} {}", r.id, lda),
        None => r.id.to_string(),
    };

    emit(writer, Event::Start(BytesStart::new("Placemark")))?;
    text_element(writer, "name", &name)?;
    emit(writer, Event::Start(BytesStart::new("description")))?;
    emit(writer, Event::CData(BytesCData::new(description(airport))))?;
    emit(writer, Event::End(BytesEnd::new("description")))?;
    text_element(
        writer,
        "styleUrl",
        &format!("#{}", airport.classification.marker.name()),
    )?;
    emit(writer, Event::Start(BytesStart::new("Point")))?;
    text_element(writer, "coordinates", &format!("{},{},0", lon, lat))?;
    emit(writer, Event::End(BytesEnd::new("Point")))?;
    emit(writer, Event::End(BytesEnd::new("Placemark")))
}

/// Render the KML document for a run.
pub fn render_kml(report: &RunReport) -> Result<String, ExportError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    emit(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    emit(
        &mut writer,
        Event::Start(BytesStart::new("kml").with_attributes([("xmlns", "http://www.opengis.net/kml/2.2")])),
    )?;
    emit(&mut writer, Event::Start(BytesStart::new("Document")))?;
    text_element(&mut writer, "name", &kml_filename(report))?;

    for marker in STYLED_MARKERS {
        let Some(href) = icon_href(marker) else {
            continue;
        };
        emit(
            &mut writer,
            Event::Start(BytesStart::new("Style").with_attributes([("id", marker.name())])),
        )?;
        emit(&mut writer, Event::Start(BytesStart::new("IconStyle")))?;
        emit(&mut writer, Event::Start(BytesStart::new("Icon")))?;
        text_element(&mut writer, "href", &href)?;
        emit(&mut writer, Event::End(BytesEnd::new("Icon")))?;
        emit(&mut writer, Event::End(BytesEnd::new("IconStyle")))?;
        emit(&mut writer, Event::End(BytesEnd::new("Style")))?;
    }

    emit(&mut writer, Event::Start(BytesStart::new("Placemark")))?;
    text_element(&mut writer, "name", &format!("PlanAid v{}", env!("CARGO_PKG_VERSION")))?;
    text_element(
        &mut writer,
        "description",
        &format!("Generated {} (run {})", report.completed_at.format("%Y-%m-%d %H:%M UTC"), report.run_id),
    )?;
    emit(&mut writer, Event::Start(BytesStart::new("Point")))?;
    text_element(&mut writer, "coordinates", VERSION_PIN_COORDS)?;
    emit(&mut writer, Event::End(BytesEnd::new("Point")))?;
    emit(&mut writer, Event::End(BytesEnd::new("Placemark")))?;

    for airport in report.airports.iter().filter(|a| is_mapped(a)) {
        placemark(&mut writer, airport)?;
    }

    emit(&mut writer, Event::End(BytesEnd::new("Document")))?;
    emit(&mut writer, Event::End(BytesEnd::new("kml")))?;

    String::from_utf8(writer.into_inner()).map_err(|e| ExportError::Xml(e.to_string()))
}

/// Tab-separated summary of the mapped airports.
pub fn render_summary_tsv(report: &RunReport) -> String {
    let mut out = String::from(SUMMARY_HEADER);
    out.push('\n');
    for airport in report.airports.iter().filter(|a| is_mapped(a)) {
        let r = &airport.record;
        let comment = r
            .comment
            .as_ref()
            .map(|c| c.to_string().replace(['\t', '\n', '\r'], " "))
            .unwrap_or_default();
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            r.id,
            airport.classification.marker.name(),
            r.lda_ft.map(|v| v.to_string()).unwrap_or_default(),
            comment
        ));
    }
    out
}

/// Write both exports into `output_dir`. Returns the written paths.
pub async fn write_exports(report: &RunReport, output_dir: &Path) -> Result<Vec<PathBuf>, ExportError> {
    let kml = render_kml(report)?;
    let tsv = render_summary_tsv(report);
    let kml_path = output_dir.join(kml_filename(report));
    let tsv_path = output_dir.join(SUMMARY_FILE);

    let paths = vec![kml_path.clone(), tsv_path.clone()];
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        write_atomic_file(&kml_path, kml.as_bytes())?;
        write_atomic_file(&tsv_path, tsv.as_bytes())
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))??;

    tracing::info!(
        "Exported {} mapped airports to {}",
        report.airports.iter().filter(|a| is_mapped(a)).count(),
        output_dir.display()
    );
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AirportRecord, ClassificationResult, Comment, ListMembership, RunwayLda, Verdict,
    };
    use crate::services::identifiers::AliasTable;
    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn classified(code: &str, lda: u32, verdict: Verdict, marker: Marker) -> ClassifiedAirport {
        let mut record = AirportRecord::empty(AliasTable::new().resolve(code).unwrap());
        record.latitude = Some(Decimal::new(318, 1));
        record.longitude = Some(Decimal::new(-1064, 1));
        record.lda_ft = Some(lda);
        ClassifiedAirport {
            record,
            classification: ClassificationResult {
                verdict,
                marker,
                reasons: vec![format!("{} reason", code)],
            },
        }
    }

    fn report(airports: Vec<ClassifiedAirport>) -> RunReport {
        RunReport {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            as_of: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
            sources: Vec::new(),
            override_errors: Vec::new(),
            diagnostics: Vec::new(),
            airports,
        }
    }

    fn sample() -> RunReport {
        let mut blacklisted = classified("KBBB", 9000, Verdict::Ineligible, Marker::RedCircle);
        blacklisted.record.list = ListMembership::Blacklisted;
        let mut cat1 = classified("KCCC", 9000, Verdict::Ineligible, Marker::RedCircle);
        cat1.record.category = Category::One;
        let mut green = classified("KGGG", 8000, Verdict::Eligible, Marker::Green);
        green.record.comment = Some(Comment {
            text: "Call\tahead".to_string(),
            date: None,
        });
        green.record.runways = vec![RunwayLda {
            runway_id: "04/22".to_string(),
            end_id: "04".to_string(),
            lda_ft: 8000,
        }];

        report(vec![
            classified("KAAA", 9000, Verdict::Eligible, Marker::Blue),
            blacklisted,
            cat1,
            green,
            classified("KSSS", 5000, Verdict::Ineligible, Marker::Hidden),
        ])
    }

    #[test]
    fn test_kml_omits_ineligible_airports() {
        let kml = render_kml(&sample()).unwrap();
        assert!(kml.contains("<name>KAAA 9000</name>"));
        assert!(kml.contains("<name>KCCC 9000</name>"));
        assert!(kml.contains("<name>KGGG 8000</name>"));
        assert!(!kml.contains("KBBB"), "blacklisted airport must not be drawn");
        assert!(!kml.contains("KSSS"), "short runway must not be drawn");
    }

    #[test]
    fn test_kml_styles_and_coordinates() {
        let kml = render_kml(&sample()).unwrap();
        assert!(kml.contains("<Style id=\"red-diamond\">"));
        assert!(kml.contains("paddle/red-circle.png"));
        assert!(kml.contains("<styleUrl>#blue</styleUrl>"));
        assert!(kml.contains("<coordinates>-106.4,31.8,0</coordinates>"));
        assert!(kml.contains("<![CDATA[KGGG<br/>KGGG reason"));
        assert!(kml.contains("04/22 (04): 8000"));
    }

    #[test]
    fn test_cdata_terminator_in_reason_is_split() {
        let mut airport = classified("KAAA", 9000, Verdict::Eligible, Marker::Blue);
        airport
            .classification
            .reasons
            .push("ramp <closed> ]]> call ahead".to_string());
        let kml = render_kml(&report(vec![airport])).unwrap();

        assert!(kml.contains("ramp <closed> ]]]]><![CDATA[> call ahead"));
        assert_eq!(kml.matches("<![CDATA[").count(), kml.matches("]]>").count());
        assert!(kml.contains("<name>KAAA 9000</name>"));
    }

    #[test]
    fn test_summary_tsv() {
        let tsv = render_summary_tsv(&sample());
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(lines[0], "ICAO\tPinColor\tRunwayLength\tComments");
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "KAAA\tblue\t9000\t");
        assert_eq!(lines[2], "KCCC\tred-circle\t9000\t");
        assert_eq!(lines[3], "KGGG\tgreen\t8000\tCall ahead");
    }

    #[test]
    fn test_kml_filename_uses_as_of_date() {
        assert_eq!(kml_filename(&sample()), "PlanAid Apts 01 Oct 2026.kml");
    }

    #[tokio::test]
    async fn test_write_exports() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_exports(&sample(), dir.path()).await.unwrap();
        assert_eq!(paths.len(), 2);
        for path in paths {
            assert!(path.exists(), "{} missing", path.display());
        }
    }
}

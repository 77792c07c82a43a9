use std::io::Cursor;

use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use time::{Date, Duration, Month};

use crate::adapters::{AdapterError, Extraction, ParsedValue, SourceAdapter, ValueKind};
use crate::candidates::ProviderId;
use crate::domain::timestamp::parse_date;
use crate::domain::{DataPoint, DatapointKey, Section, SourceLocator};
use crate::fetch::FetchResult;

const US_TOTAL_LABEL: &str = "United States Total";

// Zero-based cell coordinates on the summary sheet.
const REPORT_DATE_CELL: (u32, u32) = (3, 3);
const LABEL_COLUMN: u32 = 1;
const VALUE_COLUMN: u32 = 3;

/// Baker Hughes North America rig count workbook.
///
/// Reads the first sheet: the report date sits in `D4` as an Excel serial
/// date and the weekly count in column `D` of the "United States Total" row.
#[derive(Debug, Default, Clone, Copy)]
pub struct RigCountAdapter;

impl SourceAdapter for RigCountAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::BakerHughesRigCount
    }

    fn supports(&self, key: &DatapointKey) -> bool {
        key.section() == Section::Macro && key.name() == "rig_count"
    }

    fn parse(
        &self,
        result: &FetchResult,
        key: &DatapointKey,
    ) -> Result<Option<DataPoint>, AdapterError> {
        if !self.supports(key) {
            return Ok(None);
        }
        if !result.is_success() {
            return Err(AdapterError::new(
                self.id(),
                result,
                format!("unexpected status {}", result.status),
            ));
        }

        let invalid = |message: String| AdapterError::new(self.id(), result, message);
        let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(result.body.as_slice()))
            .map_err(|error| invalid(format!("invalid workbook: {error}")))?;
        let Some(sheet) = workbook.sheet_names().first().cloned() else {
            return Ok(None);
        };
        let range = workbook
            .worksheet_range(&sheet)
            .map_err(|error| invalid(format!("unreadable sheet {sheet}: {error}")))?;
        let (Some(start), Some(end)) = (range.start(), range.end()) else {
            return Ok(None);
        };

        let Some(row) = (start.0..=end.0).find(|row| {
            matches!(
                range.get_value((*row, LABEL_COLUMN)),
                Some(Data::String(label)) if label.trim().eq_ignore_ascii_case(US_TOTAL_LABEL)
            )
        }) else {
            return Ok(None);
        };
        let Some(value) = range.get_value((row, VALUE_COLUMN)).and_then(cell_number) else {
            return Ok(None);
        };

        let as_of = range.get_value(REPORT_DATE_CELL).and_then(cell_date);
        let cell = format!("D{}", row + 1);
        let locator = SourceLocator::xpath(
            format!("//x:row[@r=\"{}\"]/x:c[@r=\"{cell}\"]", row + 1),
            &format!("{US_TOTAL_LABEL} {cell}={value}"),
        )
        .map_err(|error| invalid(error.to_string()))?;

        Extraction::new(ParsedValue::plain(value), ValueKind::Number, locator)
            .with_as_of(as_of)
            .into_datapoint(self.id(), result, false)
            .map(Some)
    }
}

fn cell_number(cell: &Data) -> Option<f64> {
    match cell {
        Data::Float(value) => Some(*value),
        Data::Int(value) => Some(*value as f64),
        Data::String(text) => text.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn cell_date(cell: &Data) -> Option<Date> {
    match cell {
        Data::DateTime(value) => from_excel_serial(value.as_f64()),
        Data::Float(serial) => from_excel_serial(*serial),
        Data::Int(serial) => from_excel_serial(*serial as f64),
        Data::DateTimeIso(raw) | Data::String(raw) => parse_date(raw.get(..10).unwrap_or(raw)).ok(),
        _ => None,
    }
}

/// Excel's 1900 date system counts days from 1899-12-30.
fn from_excel_serial(serial: f64) -> Option<Date> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    let epoch = Date::from_calendar_date(1899, Month::December, 30).ok()?;
    epoch.checked_add(Duration::days(serial.floor() as i64))
}

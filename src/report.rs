//! Benchmark output: a hand-rolled JSON document plus optional progress
//! lines. No serde dependency; the document shape is fixed and flat.
//!
//! ```text
//! {
//!   "instructions": [
//!     {"inst": "nop",                "lat": "   1.00", "rcp": "   0.25"},
//!     ...
//!   ]
//! }
//! ```
//!
//! The `inst` field is padded so the value columns line up when the file is
//! read by a human.

/// Column where the "lat" key starts, matching the padded `inst` field.
const ALIGN_COL: usize = 54;

pub struct JsonWriter {
    buf: String,
    records: usize,
}

impl JsonWriter {
    pub fn new() -> JsonWriter {
        let mut buf = String::with_capacity(64 * 1024);
        buf.push_str("{\n  \"instructions\": [\n");
        JsonWriter { buf, records: 0 }
    }

    pub fn record(&mut self, inst_text: &str, lat: f64, rcp: f64) {
        if self.records > 0 {
            self.buf.push_str(",\n");
        }
        let mut line = format!("    {{\"inst\": \"{inst_text}\",");
        while line.len() < ALIGN_COL {
            line.push(' ');
        }
        line.push_str(&format!("\"lat\": \"{lat:7.2}\", \"rcp\": \"{rcp:7.2}\"}}"));
        self.buf.push_str(&line);
        self.records += 1;
    }

    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn finish(mut self) -> String {
        if self.records > 0 {
            self.buf.push('\n');
        }
        self.buf.push_str("  ]\n}\n");
        self.buf
    }
}

impl Default for JsonWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// One stderr progress line per instruction.
pub fn verbose_line(inst_text: &str, lat: f64, rcp: f64) -> String {
    format!("  {inst_text:<40}: Lat:{lat:7.2} Rcp:{rcp:7.2}")
}

//! Display-name rewriting for checked nodes

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;

/// Everything from the first `|` on is a tag block written by a previous run
static TAG_BLOCK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\|.*").expect("Invalid tag block regex"));

const PIRATE_FLAG: &str = "🏴‍☠";

/// Convert a two-letter country code into its flag emoji
pub fn country_flag(code: &str) -> String {
    let bytes = code.as_bytes();
    if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii_alphabetic) {
        return PIRATE_FLAG.to_string();
    }
    bytes
        .iter()
        .filter_map(|b| char::from_u32(0x1F1E6 + u32::from(b.to_ascii_uppercase() - b'A')))
        .collect()
}

/// Remove a previous run's tag block from a display name
pub fn strip_tags(name: &str) -> String {
    TAG_BLOCK_REGEX.replace_all(name.trim(), "").into_owned()
}

/// Format a throughput tag, KB/s below 100 and MB/s above
pub fn speed_tag(kbps: u32) -> String {
    if kbps < 100 {
        format!("{}KB/s", kbps)
    } else {
        format!("{:.1}MB/s", f64::from(kbps) / 1024.0)
    }
}

/// Join a base name with tags as `base|tag1|tag2`
pub fn compose_name(base: &str, tags: &[String]) -> String {
    let mut name = strip_tags(base);
    if !tags.is_empty() {
        name.push('|');
        name.push_str(&tags.join("|"));
    }
    name
}

/// Per-run numbering of renamed nodes (`HK_1`, `HK_2`, ...)
#[derive(Debug, Default)]
pub struct Renamer {
    counter: Mutex<HashMap<String, usize>>,
    enhanced: bool,
}

impl Renamer {
    pub fn new(enhanced: bool) -> Self {
        Self {
            counter: Mutex::new(HashMap::new()),
            enhanced,
        }
    }

    /// Produce a numbered name for a node located in `country`
    ///
    /// With enhanced tags the country-code tag (`HK²`, `HK¹-US⁰`) is used as
    /// the label; without one the plain country gets a `ˣ` marker so the two
    /// kinds never share a counter.
    pub fn rename(&self, country: &str, country_code_tag: &str) -> String {
        let flag = country_flag(country);
        let label = if self.enhanced {
            if !country_code_tag.is_empty() {
                country_code_tag.to_string()
            } else if !country.is_empty() {
                format!("{}ˣ", country)
            } else {
                country.to_string()
            }
        } else {
            country.to_string()
        };

        let n = {
            let mut counter = self.counter.lock();
            let entry = counter.entry(label.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        format!("{}{}_{}", flag, label, n)
    }

    pub fn reset(&self) {
        self.counter.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_country_flag() {
        assert_eq!(country_flag("HK"), "🇭🇰");
        assert_eq!(country_flag("us"), "🇺🇸");
        assert_eq!(country_flag("USA"), PIRATE_FLAG);
        assert_eq!(country_flag(""), PIRATE_FLAG);
        assert_eq!(country_flag("1A"), PIRATE_FLAG);
    }

    #[test]
    fn test_strip_tags() {
        assert_eq!(strip_tags("HK 01 |12.0MB/s|NF"), "HK 01");
        assert_eq!(strip_tags("  plain name  "), "plain name");
        assert_eq!(strip_tags("|only tags"), "");
    }

    #[test]
    fn test_speed_tag() {
        assert_eq!(speed_tag(42), "42KB/s");
        assert_eq!(speed_tag(1024), "1.0MB/s");
        assert_eq!(speed_tag(2560), "2.5MB/s");
    }

    #[test]
    fn test_compose_name() {
        let tags = vec!["1.0MB/s".to_string(), "NF".to_string()];
        assert_eq!(compose_name("JP 02|old|tags", &tags), "JP 02|1.0MB/s|NF");
        assert_eq!(compose_name("JP 02", &[]), "JP 02");
    }

    #[test]
    fn test_renamer_counts_per_label() {
        let renamer = Renamer::new(false);
        assert_eq!(renamer.rename("HK", ""), "🇭🇰HK_1");
        assert_eq!(renamer.rename("HK", ""), "🇭🇰HK_2");
        assert_eq!(renamer.rename("JP", ""), "🇯🇵JP_1");
        renamer.reset();
        assert_eq!(renamer.rename("HK", ""), "🇭🇰HK_1");
    }

    #[test]
    fn test_renamer_enhanced_labels() {
        let renamer = Renamer::new(true);
        assert_eq!(renamer.rename("HK", "HK²"), "🇭🇰HK²_1");
        assert_eq!(renamer.rename("HK", ""), "🇭🇰HKˣ_1");
        assert_eq!(renamer.rename("HK", "HK²"), "🇭🇰HK²_2");
    }
}

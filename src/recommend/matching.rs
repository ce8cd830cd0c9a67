/// Tag and metadata matching shared by candidate selection and scoring
pub struct TagMatching;

impl TagMatching {
    /// Fraction of `targets` that fuzzy-match any of `tags`.
    ///
    /// A pair matches when either side contains the other, ignoring case.
    /// Returns `None` when there are no targets to match against.
    pub fn fuzzy_fraction(tags: &[String], targets: &[String]) -> Option<f64> {
        if targets.is_empty() {
            return None;
        }

        let tags: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();
        let matched = targets
            .iter()
            .map(|t| t.to_lowercase())
            .filter(|target| {
                tags.iter().any(|tag| {
                    !tag.is_empty()
                        && (tag.contains(target.as_str()) || target.contains(tag.as_str()))
                })
            })
            .count();

        Some(matched as f64 / targets.len() as f64)
    }

    /// Whether `language` equals any preferred language, ignoring case
    pub fn language_preferred(language: &str, language_bias: &[String]) -> bool {
        language_bias
            .iter()
            .any(|preferred| preferred.trim().eq_ignore_ascii_case(language.trim()))
    }

    /// Parse a decade label like "2010s" into 2010
    pub fn parse_decade(era: &str) -> Option<i32> {
        let trimmed = era.trim();
        let digits = trimmed
            .strip_suffix('s')
            .or_else(|| trimmed.strip_suffix('S'))
            .unwrap_or(trimmed);
        digits.parse().ok()
    }

    pub fn decade_of(year: u32) -> u32 {
        year / 10 * 10
    }

    /// Absolute distance in years between a release year and a decade start
    pub fn years_from(year: u32, decade: i32) -> u32 {
        (i64::from(year) - i64::from(decade)).unsigned_abs() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fuzzy_fraction_matches_substrings_both_ways() {
        let tags = strings(&["Indie-Folk", "monsoon melodies", "rock"]);
        let targets = strings(&["folk", "monsoon", "Rocky Road", "jazz"]);

        // "folk" in "indie-folk", "monsoon" in "monsoon melodies", "rock" in "rocky road"
        assert_eq!(TagMatching::fuzzy_fraction(&tags, &targets), Some(0.75));
    }

    #[test]
    fn test_fuzzy_fraction_without_targets_is_none() {
        assert_eq!(TagMatching::fuzzy_fraction(&strings(&["indie"]), &[]), None);
        assert_eq!(
            TagMatching::fuzzy_fraction(&[], &strings(&["indie"])),
            Some(0.0)
        );
    }

    #[test]
    fn test_empty_tag_does_not_match_everything() {
        assert_eq!(
            TagMatching::fuzzy_fraction(&strings(&[""]), &strings(&["indie"])),
            Some(0.0)
        );
    }

    #[test]
    fn test_parse_decade() {
        assert_eq!(TagMatching::parse_decade("2010s"), Some(2010));
        assert_eq!(TagMatching::parse_decade(" 1990S "), Some(1990));
        assert_eq!(TagMatching::parse_decade("2000"), Some(2000));
        assert_eq!(TagMatching::parse_decade("eighties"), None);
        assert_eq!(TagMatching::parse_decade(""), None);
    }

    #[test]
    fn test_language_and_decade_helpers() {
        let bias = strings(&["Malayalam", "Tamil"]);
        assert!(TagMatching::language_preferred("malayalam", &bias));
        assert!(!TagMatching::language_preferred("Hindi", &bias));

        assert_eq!(TagMatching::decade_of(2019), 2010);
        assert_eq!(TagMatching::years_from(2004, 2010), 6);
        assert_eq!(TagMatching::years_from(2015, 2010), 5);
    }
}

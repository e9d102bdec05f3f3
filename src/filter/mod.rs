//! Pair filter for deciding which symbols the pipeline tracks
//!
//! Rules come from config blobs or rule files: one rule per line, lines split
//! on `\r`, `\n` or `;`. Lines starting with `#` or `//` are comments. Every
//! surviving line is a literal symbol; lines that do not look like a plain
//! symbol are additionally compiled as case-insensitive regexes.

use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// A symbol that matches this shape is a plain literal and needs no regex.
fn plain_symbol_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][\w:/-]+$").expect("static pattern"))
}

/// Literal + regex membership predicate over pair symbols.
///
/// Literal membership is O(1) on an ordered set; regex entries live in a list
/// with move-to-front promotion so recently matching patterns are re-tested
/// first when similar inputs recur.
pub struct PairFilter {
    literals: BTreeSet<String>,
    regexes: Mutex<Vec<RegexRule>>,
}

struct RegexRule {
    source: String,
    regex: Regex,
}

impl PairFilter {
    pub fn new() -> Self {
        Self {
            literals: BTreeSet::new(),
            regexes: Mutex::new(Vec::new()),
        }
    }

    /// Parse a rule blob and add its rules to the filter.
    ///
    /// Returns the number of rules added.
    pub fn add_rules(&mut self, text: &str) -> usize {
        let mut added = 0;

        for raw in text.split(['\r', '\n', ';']) {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }

            self.literals.insert(line.to_uppercase());
            added += 1;

            if !plain_symbol_re().is_match(line) {
                match RegexBuilder::new(line).case_insensitive(true).build() {
                    Ok(regex) => {
                        let mut regexes = self.regexes.lock();
                        if !regexes.iter().any(|r| r.source == line) {
                            regexes.push(RegexRule {
                                source: line.to_string(),
                                regex,
                            });
                        }
                    }
                    Err(e) => {
                        warn!(rule = %line, error = %e, "Skipping rule that failed to compile as regex");
                    }
                }
            }
        }

        debug!(
            added,
            literals = self.literals.len(),
            regexes = self.regexes.lock().len(),
            "Added pair filter rules"
        );
        added
    }

    /// True when the filter has no rules at all.
    pub fn is_empty(&self) -> bool {
        self.literals.is_empty()
    }

    /// Decide membership for one symbol.
    ///
    /// An empty filter accepts everything. A matching regex entry is promoted
    /// to the head of the list.
    pub fn matches(&self, input: &str) -> bool {
        if self.literals.is_empty() {
            return true;
        }
        if input.is_empty() {
            return false;
        }
        if self.literals.contains(&input.to_uppercase()) {
            return true;
        }

        let mut regexes = self.regexes.lock();
        let hit = regexes.iter().position(|r| r.regex.is_match(input));
        match hit {
            Some(idx) => {
                // LRU promotion
                let rule = regexes.remove(idx);
                regexes.insert(0, rule);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn regex_sources(&self) -> Vec<String> {
        self.regexes.lock().iter().map(|r| r.source.clone()).collect()
    }
}

impl Default for PairFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_accepts_everything() {
        let filter = PairFilter::new();
        assert!(filter.matches("BTCUSDT"));
        assert!(filter.matches("anything at all"));
        assert!(filter.matches(""));
    }

    #[test]
    fn literal_match_is_case_insensitive() {
        let mut filter = PairFilter::new();
        filter.add_rules("BTCUSDT");
        assert!(filter.matches("BTCUSDT"));
        assert!(filter.matches("btcusdt"));
        assert!(!filter.matches("ETHUSDT"));
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let mut filter = PairFilter::new();
        let added = filter.add_rules("# comment\n// also a comment\n\n  \nBTCUSDT");
        assert_eq!(added, 1);
        assert!(!filter.matches("# comment"));
        assert!(!filter.matches("// also a comment"));
    }

    #[test]
    fn regex_rules_match_and_literals_coexist() {
        let mut filter = PairFilter::new();
        filter.add_rules("BTCUSDT\n.*ETH.*\n# comment");

        assert!(filter.matches("BTCUSDT"));
        assert!(filter.matches("ETHUSDT"));
        assert!(filter.matches("wethusdt"));
        assert!(!filter.matches("XRPUSDT"));
    }

    #[test]
    fn semicolon_separated_rules() {
        let mut filter = PairFilter::new();
        filter.add_rules("BTCUSDT;ETHUSDT;^XRP.+$");
        assert!(filter.matches("BTCUSDT"));
        assert!(filter.matches("XRPUSDT"));
        assert!(!filter.matches("DOGEUSDT"));
    }

    #[test]
    fn with_rules_empty_input_never_matches() {
        let mut filter = PairFilter::new();
        filter.add_rules(".*");
        assert!(!filter.matches(""));
    }

    #[test]
    fn matching_regex_is_promoted_to_head() {
        let mut filter = PairFilter::new();
        filter.add_rules(".*BTC.*\n.*ETH.*\n.*XRP.*");

        assert!(filter.matches("wETHer"));
        assert_eq!(
            filter.regex_sources(),
            vec![".*ETH.*", ".*BTC.*", ".*XRP.*"]
        );

        assert!(filter.matches("XRPEUR"));
        assert_eq!(
            filter.regex_sources(),
            vec![".*XRP.*", ".*ETH.*", ".*BTC.*"]
        );
    }

    #[test]
    fn invalid_regex_still_adds_literal() {
        let mut filter = PairFilter::new();
        let added = filter.add_rules("BTC[USDT");
        assert_eq!(added, 1);
        assert!(filter.matches("btc[usdt"));
        assert!(!filter.matches("BTCUSDT"));
    }
}

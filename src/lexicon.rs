use crate::catalog::{ColumnRef, SchemaCatalog};
use crate::intent::Span;
use lazy_static::lazy_static;
use regex::Regex;
use strsim::jaro_winkler;

lazy_static! {
    static ref WORD: Regex = Regex::new(r"[A-Za-z][A-Za-z0-9_']*").unwrap();
    static ref SEPARATORS: Regex = Regex::new(r"[\s_]+").unwrap();
}

/// A word of the question with its stem and byte span.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub stem: String,
    pub span: Span,
}

/// What a lexicon phrase stands for in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Table(String),
    Column(ColumnRef),
    Value { column: ColumnRef, value: String },
}

/// A phrase of the question recognised as one or more catalog terms.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub terms: Vec<Term>,
    pub span: Span,
    /// Index of the first token after the phrase.
    pub next_token: usize,
    pub fuzzy: bool,
}

impl Hit {
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().filter_map(|t| match t {
            Term::Table(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnRef> {
        self.terms.iter().filter_map(|t| match t {
            Term::Column(c) => Some(c),
            _ => None,
        })
    }

    pub fn values(&self) -> impl Iterator<Item = (&ColumnRef, &str)> {
        self.terms.iter().filter_map(|t| match t {
            Term::Value { column, value } => Some((column, value.as_str())),
            _ => None,
        })
    }
}

struct Entry {
    words: Vec<String>,
    term: Term,
}

/// Phrase dictionary built from table names, column names, synonyms and
/// known values of the catalog. Matching is case-insensitive on stemmed words.
pub struct Lexicon {
    entries: Vec<Entry>,
    /// Jaro-Winkler threshold for typo tolerance on table words.
    pub similarity_threshold: f64,
    max_words: usize,
}

impl Lexicon {
    pub fn from_catalog(catalog: &SchemaCatalog) -> Self {
        let mut entries = Vec::new();
        for table in &catalog.tables {
            for phrase in std::iter::once(&table.name).chain(table.synonyms.iter()) {
                entries.push(Entry {
                    words: phrase_words(phrase),
                    term: Term::Table(table.name.clone()),
                });
            }
            for column in &table.columns {
                let column_ref = ColumnRef::new(&table.name, &column.name);
                for phrase in std::iter::once(&column.name).chain(column.synonyms.iter()) {
                    entries.push(Entry {
                        words: phrase_words(phrase),
                        term: Term::Column(column_ref.clone()),
                    });
                }
                for known in &column.values {
                    for phrase in std::iter::once(&known.value).chain(known.aliases.iter()) {
                        entries.push(Entry {
                            words: phrase_words(phrase),
                            term: Term::Value {
                                column: column_ref.clone(),
                                value: known.value.clone(),
                            },
                        });
                    }
                }
            }
        }
        entries.retain(|e| !e.words.is_empty());
        let max_words = entries.iter().map(|e| e.words.len()).max().unwrap_or(1);

        Self {
            entries,
            similarity_threshold: 0.93,
            max_words,
        }
    }

    /// Terms whose phrase is exactly `phrase` after stemming.
    pub fn lookup(&self, phrase: &str) -> Vec<Term> {
        let words = phrase_words(phrase);
        let mut terms: Vec<Term> = Vec::new();
        for entry in self.entries.iter().filter(|e| e.words == words) {
            if !terms.contains(&entry.term) {
                terms.push(entry.term.clone());
            }
        }
        terms
    }

    /// Scan tokens left to right, taking the longest phrase at each position.
    pub fn scan(&self, tokens: &[Token]) -> Vec<Hit> {
        let mut hits = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            match self.longest_at(tokens, i) {
                Some(hit) => {
                    i = hit.next_token;
                    hits.push(hit);
                }
                None => {
                    if let Some(hit) = self.fuzzy_at(tokens, i) {
                        hits.push(hit);
                    }
                    i += 1;
                }
            }
        }
        hits
    }

    fn longest_at(&self, tokens: &[Token], start: usize) -> Option<Hit> {
        let longest = self.max_words.min(tokens.len() - start);
        for len in (1..=longest).rev() {
            let window: Vec<&str> = tokens[start..start + len].iter().map(|t| t.stem.as_str()).collect();
            let mut terms: Vec<Term> = Vec::new();
            for entry in &self.entries {
                if entry.words.len() == len && entry.words.iter().zip(&window).all(|(a, b)| a == b) && !terms.contains(&entry.term) {
                    terms.push(entry.term.clone());
                }
            }
            if !terms.is_empty() {
                return Some(Hit {
                    terms,
                    span: (tokens[start].span.0, tokens[start + len - 1].span.1),
                    next_token: start + len,
                    fuzzy: false,
                });
            }
        }
        None
    }

    fn fuzzy_at(&self, tokens: &[Token], start: usize) -> Option<Hit> {
        let token = &tokens[start];
        if token.stem.len() < 6 {
            return None;
        }
        let mut best: Option<(f64, &Entry)> = None;
        for entry in &self.entries {
            if entry.words.len() != 1 || !matches!(entry.term, Term::Table(_)) {
                continue;
            }
            let score = similarity(&token.stem, &entry.words[0]);
            if score >= self.similarity_threshold && best.map_or(true, |(s, _)| score > s) {
                best = Some((score, entry));
            }
        }
        best.map(|(_, entry)| Hit {
            terms: vec![entry.term.clone()],
            span: token.span,
            next_token: start + 1,
            fuzzy: true,
        })
    }
}

/// Split the question into words, keeping byte offsets into the original text.
pub fn tokenize(text: &str) -> Vec<Token> {
    WORD.find_iter(text)
        .map(|m| {
            let lower = m.as_str().to_ascii_lowercase();
            Token {
                stem: stem(&lower),
                text: lower,
                span: (m.start(), m.end()),
            }
        })
        .collect()
}

/// Plural to singular, nothing more.
pub fn stem(word: &str) -> String {
    let mut w = word.to_ascii_lowercase();
    if let Some(base) = w.strip_suffix("'s") {
        w = base.to_string();
    }
    let w = w.trim_end_matches('\'').to_string();
    if w.len() <= 3 {
        return w;
    }
    if let Some(base) = w.strip_suffix("ies") {
        if base.len() >= 2 {
            return format!("{}y", base);
        }
    }
    if w.ends_with("sses") || w.ends_with("ches") || w.ends_with("shes") || w.ends_with("xes") {
        return w[..w.len() - 2].to_string();
    }
    if w.ends_with("ss") || w.ends_with("us") || w.ends_with("is") {
        return w;
    }
    match w.strip_suffix('s') {
        Some(base) => base.to_string(),
        None => w,
    }
}

fn phrase_words(phrase: &str) -> Vec<String> {
    SEPARATORS
        .split(phrase.trim())
        .filter(|w| !w.is_empty())
        .map(stem)
        .collect()
}

/// Jaro-Winkler with a small bonus when one string contains the other.
pub fn similarity(a: &str, b: &str) -> f64 {
    let score = jaro_winkler(a, b);
    let is_substring = !a.is_empty() && !b.is_empty() && (a.contains(b) || b.contains(a));
    let bonus = if is_substring {
        let len_diff = (a.len() as f64 - b.len() as f64).abs();
        let max_len = a.len().max(b.len()) as f64;
        (1.0 - len_diff / max_len) * 0.1
    } else {
        0.0
    };
    (score + bonus).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stem() {
        assert_eq!(stem("Users"), "user");
        assert_eq!(stem("categories"), "category");
        assert_eq!(stem("cities"), "city");
        assert_eq!(stem("boxes"), "box");
        assert_eq!(stem("status"), "status");
        assert_eq!(stem("address"), "address");
        assert_eq!(stem("user's"), "user");
        assert_eq!(stem("all"), "all");
    }

    #[test]
    fn test_tokenize_keeps_spans() {
        let tokens = tokenize("How many Users?");
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[2].text, "users");
        assert_eq!(tokens[2].stem, "user");
        assert_eq!(tokens[2].span, (9, 14));
    }

    #[test]
    fn test_longest_phrase_wins() {
        let lexicon = Lexicon::from_catalog(&SchemaCatalog::storefront());
        let hits = lexicon.scan(&tokenize("list order items"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tables().collect::<Vec<_>>(), vec!["order_items"]);
    }

    #[test]
    fn test_shared_column_reports_every_owner() {
        let lexicon = Lexicon::from_catalog(&SchemaCatalog::storefront());
        let hits = lexicon.scan(&tokenize("average price"));
        let owners: Vec<&str> = hits[0].columns().map(|c| c.table.as_str()).collect();
        assert_eq!(owners, vec!["products", "order_items"]);
    }

    #[test]
    fn test_value_aliases() {
        let lexicon = Lexicon::from_catalog(&SchemaCatalog::storefront());
        let hits = lexicon.scan(&tokenize("any novels left?"));
        let values: Vec<(&ColumnRef, &str)> = hits.iter().flat_map(|h| h.values()).collect();
        assert_eq!(values, vec![(&ColumnRef::new("products", "category"), "Books")]);
    }

    #[test]
    fn test_fuzzy_table_match() {
        let lexicon = Lexicon::from_catalog(&SchemaCatalog::storefront());
        let hits = lexicon.scan(&tokenize("show all prodcts"));
        assert_eq!(hits.len(), 1);
        assert!(hits[0].fuzzy);
        assert_eq!(hits[0].tables().collect::<Vec<_>>(), vec!["products"]);
    }

    #[test]
    fn test_similarity_substring_bonus() {
        assert!(similarity("product", "products") > jaro_winkler("product", "products"));
        assert!(similarity("john", "zebra") < 0.7);
    }
}

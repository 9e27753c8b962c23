use glob::{MatchOptions, Pattern};
use std::{
    fmt::{self, Display},
    str::FromStr,
};
use valuable::{Valuable, Value, Visit};

/// A glob-style pattern built from user input, matched against dump file names,
/// e.g. `*-pages-articles*.xml.bz2`.
///
/// Implements `FromStr` with a length limit so it can be used directly as a `clap` argument.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilePattern(pub Pattern);

const MAX_LEN: usize = 200;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl FilePattern {
    pub fn matches(&self, file_name: &str) -> bool {
        self.0.matches_with(file_name, MATCH_OPTIONS)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for FilePattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Valuable for FilePattern {
    fn as_value(&self) -> Value<'_> {
        Value::String(self.as_str())
    }

    fn visit(&self, visit: &mut dyn Visit) {
        visit.visit_value(self.as_value());
    }
}

impl FromStr for FilePattern {
    type Err = clap::Error;

    fn from_str(s: &str) -> std::result::Result<FilePattern, clap::Error> {
        if s.is_empty() || s.len() > MAX_LEN {
            return Err(clap::error::Error::raw(
                clap::error::ErrorKind::ValueValidation,
                format!("The file pattern must be between 1 and {MAX_LEN} characters long \
                         len={len}",
                        len = s.len())));
        }

        let pattern = Pattern::new(s)
            .map_err(|e| clap::error::Error::raw(
                clap::error::ErrorKind::ValueValidation,
                format!("Error parsing file pattern: {e}\n\n\
                         Patterns use glob syntax: `*` matches any characters, `?` matches one \
                         character, `[abc]` matches one of the listed characters.")))?;
        Ok(FilePattern(pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::FilePattern;

    #[test]
    fn matches_file_names() {
        let pattern: FilePattern = "*-pages-articles*.xml.bz2".parse().unwrap();
        assert!(!pattern.matches("enwiki-20230301-pages-articles1.xml-p1p41242.bz2"));
        assert!(pattern.matches("enwiki-20230301-pages-articles.xml.bz2"));
        assert!(pattern.matches("enwiki-20230301-pages-articles-multistream.xml.bz2"));
        assert!(!pattern.matches("enwiki-20230301-abstract.xml.gz"));

        let single: FilePattern = "enwiki-2023030?-abstract.xml.gz".parse().unwrap();
        assert!(single.matches("enwiki-20230301-abstract.xml.gz"));
        assert!(!single.matches("enwiki-20230301-abstract.xml.gz.tmp"));
    }

    #[test]
    fn rejects_bad_patterns() {
        assert!("".parse::<FilePattern>().is_err());
        assert!("[unclosed".parse::<FilePattern>().is_err());
        assert!("*".repeat(201).parse::<FilePattern>().is_err());
    }
}

//! Zero-allocation classification of the leading SQL verb.

/// Routing class of a client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// `SELECT ...` - safe to serve from a replica.
    Read,
    /// `INSERT`/`UPDATE`/`DELETE` - must go to the master.
    Write,
    /// Anything else. Routed to the master as the safe choice.
    Unknown,
}

/// Maps raw frame bytes to a [`QueryKind`].
///
/// Implementations must not allocate and must leave the input untouched;
/// the same bytes are forwarded verbatim to the backend afterwards.
pub trait QueryClassifier: Send + Sync {
    /// Examines the head of `frame` and returns its routing class.
    fn classify(&self, frame: &[u8]) -> QueryKind;
}

const KEYWORD_LEN: usize = 6;
const SELECT: &[u8; KEYWORD_LEN] = b"SELECT";
const INSERT: &[u8; KEYWORD_LEN] = b"INSERT";
const UPDATE: &[u8; KEYWORD_LEN] = b"UPDATE";
const DELETE: &[u8; KEYWORD_LEN] = b"DELETE";

/// Classifier that matches the first keyword of the frame, case
/// insensitively, after skipping leading ASCII whitespace.
///
/// Operates on the slice with absolute indexing only: no copies, no case
/// normalisation pass, no partial reads of anything past byte six.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerbClassifier;

impl VerbClassifier {
    fn matches(frame: &[u8], keyword: &[u8; KEYWORD_LEN]) -> bool {
        frame
            .iter()
            .zip(keyword.iter())
            .all(|(b, k)| to_upper(*b) == *k)
    }
}

impl QueryClassifier for VerbClassifier {
    fn classify(&self, frame: &[u8]) -> QueryKind {
        let start = frame
            .iter()
            .position(|b| !is_sql_whitespace(*b))
            .unwrap_or(frame.len());
        let rest = &frame[start..];

        if rest.len() < KEYWORD_LEN {
            return QueryKind::Unknown;
        }
        if Self::matches(rest, SELECT) {
            QueryKind::Read
        } else if Self::matches(rest, INSERT)
            || Self::matches(rest, UPDATE)
            || Self::matches(rest, DELETE)
        {
            QueryKind::Write
        } else {
            QueryKind::Unknown
        }
    }
}

#[inline]
fn to_upper(b: u8) -> u8 {
    if b.is_ascii_lowercase() {
        b - 32
    } else {
        b
    }
}

#[inline]
fn is_sql_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(frame: &[u8]) -> QueryKind {
        VerbClassifier.classify(frame)
    }

    #[test]
    fn test_select_is_read() {
        assert_eq!(classify(b"SELECT 1;"), QueryKind::Read);
        assert_eq!(classify(b"   SELECT * FROM t"), QueryKind::Read);
        assert_eq!(classify(b"\r\n\tselect id from users"), QueryKind::Read);
    }

    #[test]
    fn test_mutations_are_writes() {
        assert_eq!(classify(b"INSERT INTO t VALUES(1)"), QueryKind::Write);
        assert_eq!(classify(b"UPDATE t SET a = 1"), QueryKind::Write);
        assert_eq!(classify(b"DELETE FROM t"), QueryKind::Write);
        assert_eq!(classify(b"delete from t where id = 9"), QueryKind::Write);
    }

    #[test]
    fn test_mixed_case_matches() {
        assert_eq!(classify(b"SeLeCt now()"), QueryKind::Read);
        assert_eq!(classify(b"iNsErT into t values(2)"), QueryKind::Write);
    }

    #[test]
    fn test_empty_input_is_unknown() {
        assert_eq!(classify(b""), QueryKind::Unknown);
    }

    #[test]
    fn test_whitespace_only_is_unknown() {
        assert_eq!(classify(b"   \t\r\n "), QueryKind::Unknown);
    }

    #[test]
    fn test_short_prefix_is_unknown() {
        assert_eq!(classify(b"SELEC"), QueryKind::Unknown);
        assert_eq!(classify(b"  SEL"), QueryKind::Unknown);
    }

    #[test]
    fn test_other_statements_are_unknown() {
        assert_eq!(classify(b"BEGIN;"), QueryKind::Unknown);
        assert_eq!(classify(b"COMMIT;"), QueryKind::Unknown);
        assert_eq!(classify(b"TRUNCATE t"), QueryKind::Unknown);
        assert_eq!(classify(b"SELECTED"), QueryKind::Read);
    }

    #[test]
    fn test_classification_leaves_input_untouched() {
        let frame = b"  UPDATE t SET a = 1".to_vec();
        let before = frame.clone();
        let _ = classify(&frame);
        assert_eq!(frame, before);
    }
}

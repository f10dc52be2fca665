use crate::KeyValue;

/// One `(word, "1")` pair per word; words are maximal runs of letters and
/// digits.
pub fn map(_filename: &str, contents: &str) -> Vec<KeyValue> {
    contents
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| KeyValue::new(w, "1"))
        .collect()
}

/// Sum of the partial counts of one word.
pub fn reduce(_key: &str, values: &[String]) -> String {
    values
        .iter()
        .filter_map(|v| v.parse::<u64>().ok())
        .sum::<u64>()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wc() {
        let kvs = map("f", "a b, a\n\nc1 ");
        let words: Vec<&str> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(words, vec!["a", "b", "a", "c1"]);
        assert_eq!(reduce("a", &["1".to_owned(), "2".to_owned()]), "3");
    }
}

//! Encoding of connection option strings.
//!
//! The `connect` request carries the job's JDBC-style options as a single
//! `props` string: `key=value` pairs joined by `;`. Keys and values are passed
//! through verbatim; the daemon interprets them.

/// Join option pairs into the `props` envelope.
///
/// Returns `None` when there are no options, in which case the `props`
/// field is omitted from the request entirely.
///
/// ```
/// use mapepire_protocol::encode_props;
///
/// let props = encode_props([("naming", "system"), ("libraries", "QGPL,QTEMP")]);
/// assert_eq!(props.as_deref(), Some("naming=system;libraries=QGPL,QTEMP"));
/// assert_eq!(encode_props(Vec::<(&str, &str)>::new()), None);
/// ```
#[must_use]
pub fn encode_props<I, K, V>(options: I) -> Option<String>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let joined = options
        .into_iter()
        .map(|(key, value)| format!("{}={}", key.as_ref(), value.as_ref()))
        .collect::<Vec<_>>()
        .join(";");

    if joined.is_empty() { None } else { Some(joined) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_option() {
        assert_eq!(
            encode_props([("date format", "iso")]).as_deref(),
            Some("date format=iso")
        );
    }

    #[test]
    fn test_order_is_preserved() {
        let props = encode_props([("b", "2"), ("a", "1"), ("c", "3")]);
        assert_eq!(props.as_deref(), Some("b=2;a=1;c=3"));
    }

    #[test]
    fn test_empty_value_is_kept() {
        assert_eq!(encode_props([("errors", "")]).as_deref(), Some("errors="));
    }

    proptest! {
        #[test]
        fn test_pairs_split_back(
            pairs in prop::collection::vec(("[a-z][a-z ]{0,19}", "[A-Za-z0-9*,/.]{0,20}"), 1..12)
        ) {
            let props = encode_props(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            let props = props.unwrap_or_default();

            let decoded: Vec<(String, String)> = props
                .split(';')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            prop_assert_eq!(decoded, pairs);
        }
    }
}

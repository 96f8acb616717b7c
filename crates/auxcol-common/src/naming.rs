//! Column naming convention
//!
//! Attribute columns live next to the base column of their container:
//!
//! ```text
//! ElectronsAux.            base column (attribute-bearing: ends with "Aux.")
//! ElectronsAuxDyn.pt       attribute "pt"
//! ElectronsAuxDyn.charge   attribute "charge"
//! ```
//!
//! The same names are used by both physical backends, so the layout is
//! backend-agnostic at the naming level.
//!
//! Row-level keys written by a multi-stream producer may carry a
//! `__STREAM[<tag>]` segment so that same-named objects merged from
//! several logical streams do not collide.

/// Suffix of base columns whose records carry dynamic attributes
pub const AUX_POSTFIX: &str = "Aux.";

/// Marker appended to the base name to form attribute column names
pub const AUXDYN_POSTFIX: &str = "Dyn.";

/// Opening of the stream disambiguation segment in row-level keys
pub const STREAM_MARK: &str = "__STREAM[";

/// Separator stripped from the end of base names
const SEPARATOR: char = '.';

/// Physical column name of attribute `attr_name` of container `base_name`
#[must_use]
pub fn column_name(attr_name: &str, base_name: &str) -> String {
    let base = base_name.strip_suffix(SEPARATOR).unwrap_or(base_name);
    let mut name = String::with_capacity(base.len() + AUXDYN_POSTFIX.len() + attr_name.len());
    name.push_str(base);
    name.push_str(AUXDYN_POSTFIX);
    name.push_str(attr_name);
    name
}

/// Prefix shared by all attribute columns of `base_name`
#[must_use]
pub fn column_prefix(base_name: &str) -> String {
    column_name("", base_name)
}

/// Recover the attribute name from an attribute column of `base_name`
#[must_use]
pub fn attribute_from_column<'a>(column: &'a str, base_name: &str) -> Option<&'a str> {
    let prefix = column_prefix(base_name);
    column
        .strip_prefix(prefix.as_str())
        .filter(|attr| !attr.is_empty())
}

/// True if the base column holds records that carry dynamic attributes
#[must_use]
pub fn is_attribute_bearing_column(base_name: &str) -> bool {
    base_name.ends_with(AUX_POSTFIX)
}

/// Key of the container used by input rename requests
#[must_use]
pub fn container_key(base_name: &str) -> &str {
    base_name.strip_suffix(SEPARATOR).unwrap_or(base_name)
}

/// Split a stream disambiguation segment out of a row-level key.
///
/// Returns `(key without the segment, stream tag)`, or `None` if the key is
/// unmarked. A marker without a closing `]` is treated as unmarked.
#[must_use]
pub fn extract_stream_marker(name: &str) -> Option<(String, String)> {
    let pos = name.find(STREAM_MARK)?;
    let tag_start = pos + STREAM_MARK.len();
    let tag_len = name[tag_start..].find(']')?;
    let tag_end = tag_start + tag_len;
    let mut clean = String::with_capacity(name.len());
    clean.push_str(&name[..pos]);
    clean.push_str(&name[tag_end + 1..]);
    Some((clean, name[tag_start..tag_end].to_string()))
}

/// Make a row-level key stream-unique.
///
/// For attribute-bearing keys the segment goes before the `Aux.` postfix so
/// the result is still recognized as attribute-bearing.
#[must_use]
pub fn insert_stream_marker(key: &str, stream: &str) -> String {
    match key.strip_suffix(AUX_POSTFIX) {
        Some(base) => format!("{base}{STREAM_MARK}{stream}]{AUX_POSTFIX}"),
        None => format!("{key}{STREAM_MARK}{stream}]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_name() {
        assert_eq!(column_name("pt", "ElectronsAux."), "ElectronsAuxDyn.pt");
        assert_eq!(column_name("pt", "ElectronsAux"), "ElectronsAuxDyn.pt");
        assert_eq!(column_prefix("EventInfoAux."), "EventInfoAuxDyn.");
    }

    #[test]
    fn test_attribute_from_column() {
        assert_eq!(
            attribute_from_column("ElectronsAuxDyn.pt", "ElectronsAux."),
            Some("pt")
        );
        assert_eq!(attribute_from_column("ElectronsAuxDyn.", "ElectronsAux."), None);
        assert_eq!(attribute_from_column("MuonsAuxDyn.pt", "ElectronsAux."), None);
        // Attribute names may themselves contain separators
        assert_eq!(
            attribute_from_column("ElectronsAuxDyn.trk.z0", "ElectronsAux."),
            Some("trk.z0")
        );
    }

    #[test]
    fn test_attribute_bearing() {
        assert!(is_attribute_bearing_column("ElectronsAux."));
        assert!(!is_attribute_bearing_column("ElectronsAuxDyn.pt"));
        assert!(!is_attribute_bearing_column("Electrons"));
        assert_eq!(container_key("ElectronsAux."), "ElectronsAux");
    }

    #[test]
    fn test_stream_marker_roundtrip() {
        let marked = insert_stream_marker("FileMetaDataAux.", "file1.root");
        assert_eq!(marked, "FileMetaData__STREAM[file1.root]Aux.");
        assert!(is_attribute_bearing_column(&marked));
        assert_eq!(
            extract_stream_marker(&marked),
            Some(("FileMetaDataAux.".to_string(), "file1.root".to_string()))
        );

        let plain = insert_stream_marker("FileMetaData", "s2");
        assert_eq!(
            extract_stream_marker(&plain),
            Some(("FileMetaData".to_string(), "s2".to_string()))
        );
    }

    #[test]
    fn test_stream_marker_unmarked_or_malformed() {
        assert_eq!(extract_stream_marker("FileMetaData"), None);
        assert_eq!(extract_stream_marker("FileMetaData__STREAM[open"), None);
        assert_eq!(extract_stream_marker("Tracks[0]"), None);
    }
}

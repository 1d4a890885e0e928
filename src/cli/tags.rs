use crate::chunk::{ConstantTagTable, Version};
use crate::error::{Error, Result};
use serde_json::json;

/// Constant tag table of a dialect as pretty JSON.
pub fn tags_json(version: Version) -> Result<String> {
    let table = ConstantTagTable::for_version(version);
    let entries: Vec<_> = table
        .entries()
        .iter()
        .map(|(tag, kind)| json!({ "tag": tag, "kind": kind }))
        .collect();
    let document = json!({ "version": version, "tags": entries });
    Ok(serde_json::to_string_pretty(&document)?)
}

fn parse_version(text: &str) -> Result<Version> {
    Version::parse(text).ok_or_else(|| Error::invalid_args(format!("unknown Lua version {:?}", text)))
}

/// Run the tags subcommand
pub fn tags(version: &str) -> Result<()> {
    println!("{}", tags_json(parse_version(version)?)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lua54_tags() {
        let text = tags_json(Version::Lua54).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["version"], "5.4");
        let tags = value["tags"].as_array().unwrap();
        assert!(tags.iter().any(|t| t["tag"] == 0x11 && t["kind"] == "true"));
        assert!(tags.iter().any(|t| t["tag"] == 0x14 && t["kind"] == "long_string"));
    }

    #[test]
    fn test_unknown_version_is_bad_input() {
        let err = parse_version("6.0").unwrap_err();
        assert!(matches!(err, Error::InvalidArgs { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Input);
        assert_eq!(parse_version("5.3").unwrap(), Version::Lua53);
    }
}

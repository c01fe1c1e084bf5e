//! Memory view grammar.
//!
//! ```text
//! perm   := U | P | [R][W][X]   (R mandatory, each letter at most once, any order)
//! entry  := name:perm
//! config := entry,entry,...
//! ```
//!
//! `P` (pristine) is only accepted for the literal name `self`, and `self`
//! only accepts `P`. The `self` entry is not returned: it sets the pristine
//! flag instead.

use std::collections::BTreeSet;

use crate::config::Prot;
use crate::error::ConfigError;

const DELIMITER_PKGS: char = ',';
const DELIMITER_ENTRY: char = ':';
const SELF_IDENTIFIER: &str = "self";

/// One `name:perm` entry of a memory view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub name: String,
    pub prot: Prot,
}

/// Strip one layer of double quotes, as emitted by the toolchain.
pub(crate) fn unquote(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Parse a memory view, returning the entries in declaration order and
/// whether the sandbox is pristine.
pub fn parse_view(config: &str) -> Result<(Vec<ViewEntry>, bool), ConfigError> {
    let config = unquote(config);
    if config.is_empty() {
        return Ok((Vec::new(), false));
    }

    let mut pristine = false;
    let mut seen = BTreeSet::new();
    let mut entries = Vec::new();
    for raw in config.split(DELIMITER_PKGS) {
        let entry = parse_entry(raw)?;
        if !seen.insert(entry.name.clone()) {
            return Err(ConfigError::DuplicateName(entry.name));
        }
        if entry.name == SELF_IDENTIFIER {
            pristine = true;
            continue;
        }
        entries.push(entry);
    }
    Ok((entries, pristine))
}

fn parse_entry(raw: &str) -> Result<ViewEntry, ConfigError> {
    let parts: Vec<&str> = raw.split(DELIMITER_ENTRY).collect();
    if parts.len() != 2 {
        return Err(ConfigError::MalformedEntry(raw.to_string()));
    }
    let name = parts[0].trim();
    if name.is_empty() {
        return Err(ConfigError::EmptyName(raw.to_string()));
    }
    let perm = parts[1].trim();
    let prot = parse_perm(name, perm)?;

    match (name == SELF_IDENTIFIER, prot == Prot::P) {
        (false, true) => Err(ConfigError::PristineNotSelf(name.to_string())),
        (true, false) => Err(ConfigError::SelfNotPristine(perm.to_string())),
        _ => Ok(ViewEntry {
            name: name.to_string(),
            prot,
        }),
    }
}

fn parse_perm(name: &str, perm: &str) -> Result<Prot, ConfigError> {
    let invalid = || ConfigError::InvalidPermission {
        name: name.to_string(),
        perm: perm.to_string(),
    };

    match perm {
        "" => return Err(ConfigError::EmptyPermission(name.to_string())),
        "U" => return Ok(Prot::U),
        "P" => return Ok(Prot::P),
        p if p.len() > 3 => return Err(invalid()),
        _ => {}
    }

    let mut prot = Prot::empty();
    for c in perm.chars() {
        let bit = match c {
            'R' => Prot::R,
            'W' => Prot::W,
            'X' => Prot::X,
            _ => return Err(invalid()),
        };
        if prot.intersects(bit) {
            return Err(invalid());
        }
        prot |= bit;
    }
    if !prot.contains(Prot::R) {
        return Err(invalid());
    }
    Ok(prot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn single(s: &str) -> Prot {
        let (entries, _) = parse_view(s).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "foo");
        entries[0].prot
    }

    #[test]
    fn test_parse_single_entries() {
        assert_eq!(single("foo:U"), Prot::U);
        assert_eq!(single("foo:R"), Prot::R);
        assert_eq!(single("foo:RX"), Prot::R | Prot::X);
        assert_eq!(single("foo:XR"), Prot::R | Prot::X);
        assert_eq!(single("foo:WR"), Prot::R | Prot::W);
        assert_eq!(single("foo:XWR"), Prot::RWX);
        assert_eq!(single(" foo : RWX "), Prot::RWX);
    }

    #[test]
    fn test_parse_empty_view() {
        assert_eq!(parse_view("").unwrap(), (vec![], false));
        assert_eq!(parse_view("\"\"").unwrap(), (vec![], false));
    }

    #[test]
    fn test_parse_multiple_entries() {
        let (entries, pristine) = parse_view("foo:R,bar:RW,farr:RX,dar:RWX").unwrap();
        assert!(!pristine);
        let got: Vec<(&str, Prot)> = entries.iter().map(|e| (e.name.as_str(), e.prot)).collect();
        assert_eq!(
            got,
            vec![
                ("foo", Prot::R),
                ("bar", Prot::R | Prot::W),
                ("farr", Prot::R | Prot::X),
                ("dar", Prot::RWX),
            ]
        );
    }

    #[test]
    fn test_parse_quoted_view() {
        let (entries, _) = parse_view("\"foo:R,bar:RW\"").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].prot, Prot::R | Prot::W);
    }

    #[test]
    fn test_parse_self_pristine() {
        let (entries, pristine) = parse_view("self:P,foo:R").unwrap();
        assert!(pristine);
        assert_eq!(entries, vec![ViewEntry { name: "foo".into(), prot: Prot::R }]);
        assert_eq!(
            parse_view("self:R"),
            Err(ConfigError::SelfNotPristine("R".into()))
        );
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        for bad in [
            ":", "foo", "foo:", ":R", ":W", ":X", ":U", ":P", "foo:RP", "foo:WX", "foo:W",
            "foo:UR", "foo:RR", "foo:RWXR", "foo:P", "a:b:R", "foo: RWX,,bar:RX",
        ] {
            assert!(parse_view(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_parse_rejects_duplicates() {
        assert_eq!(
            parse_view("foo:RWX,bar:RX,foo:RWX"),
            Err(ConfigError::DuplicateName("foo".into()))
        );
    }

    #[test]
    fn test_parse_pristine_not_self() {
        assert_eq!(
            parse_view("foo:P"),
            Err(ConfigError::PristineNotSelf("foo".into()))
        );
    }
}

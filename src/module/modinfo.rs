//! `modinfo` output parsing.
//!
//! `modinfo <file>` prints one `key:   value` pair per line. Keys repeat
//! (`alias`, `parm`). Signature dumps continue on lines indented with tabs;
//! free-text values may continue on unindented lines.

use super::is_module_identifier;

/// Fields of interest from one module's metadata block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleMetadata {
    pub name: Option<String>,
    pub depends: Vec<String>,
}

/// Parse a metadata block. The error string says what is wrong with it.
pub fn parse_modinfo(text: &str) -> Result<ModuleMetadata, String> {
    let mut meta = ModuleMetadata::default();
    let mut saw_field = false;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            if !saw_field {
                return Err(format!("line {}: continuation before any field", idx + 1));
            }
            continue;
        }

        let Some((key, value)) = split_field(line) else {
            // `parm` and `description` values are printed verbatim and may
            // span lines. Only the first line has to be a field.
            if !saw_field {
                return Err(format!("line {}: expected `key: value`", idx + 1));
            }
            continue;
        };
        saw_field = true;
        match key {
            "name" if meta.name.is_none() => {
                if !is_module_identifier(value) {
                    return Err(format!("invalid module name '{value}'"));
                }
                meta.name = Some(value.to_string());
            }
            "depends" => {
                for dep in value.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                    if !is_module_identifier(dep) {
                        return Err(format!("invalid dependency name '{dep}'"));
                    }
                    if !meta.depends.iter().any(|d| d == dep) {
                        meta.depends.push(dep.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    if !saw_field {
        return Err("no metadata fields".to_string());
    }
    Ok(meta)
}

fn split_field(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    valid.then_some((key, value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIRTIOFS: &str = "\
filename:       /lib/modules/6.6.0/kernel/fs/fuse/virtiofs.ko.xz
license:        GPL
description:    Virtio Filesystem
alias:          fs-virtiofs
alias:          virtio:d0000001Av*
depends:        fuse,virtio,virtio_ring
retpoline:      Y
intree:         Y
name:           virtiofs
vermagic:       6.6.0 SMP preempt mod_unload
sig_id:         PKCS#7
signature:      30:45:02:21:00:C9:3A
\t\t2F:88:11
parm:           debug:enable debug (bool)
";

    #[test]
    fn parses_name_and_depends() {
        let meta = parse_modinfo(VIRTIOFS).unwrap();
        assert_eq!(meta.name.as_deref(), Some("virtiofs"));
        assert_eq!(meta.depends, vec!["fuse", "virtio", "virtio_ring"]);
    }

    #[test]
    fn empty_depends_means_none() {
        let meta = parse_modinfo("name: virtio\ndepends:\n").unwrap();
        assert!(meta.depends.is_empty());

        let meta = parse_modinfo("name: virtio\n").unwrap();
        assert!(meta.depends.is_empty());
    }

    #[test]
    fn duplicate_dependencies_collapse() {
        let meta = parse_modinfo("name: a\ndepends: b, c,b,,\n").unwrap();
        assert_eq!(meta.depends, vec!["b", "c"]);
    }

    #[test]
    fn missing_name_is_not_an_error() {
        let meta = parse_modinfo("license: GPL\ndepends: fuse\n").unwrap();
        assert_eq!(meta.name, None);
        assert_eq!(meta.depends, vec!["fuse"]);
    }

    #[test]
    fn multi_line_values_are_skipped() {
        let text = "\
filename:       /tmp/foo.ko
description:    Foo driver
for the bar bus
name:           foo
depends:        bar
parm:           mode:Operating mode
0 = off, 1 = on (int)
parm:           level:Debug level (int)
";
        let meta = parse_modinfo(text).unwrap();
        assert_eq!(meta.name.as_deref(), Some("foo"));
        assert_eq!(meta.depends, vec!["bar"]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_modinfo("").is_err());
        assert!(parse_modinfo("this is not metadata\n").is_err());
        assert!(parse_modinfo("name: ok\ndepends: a b\n").is_err());
        assert!(parse_modinfo("\tleading continuation\n").is_err());
    }
}

//! Source file lookup for patch providers, for display in host UI.
//! A failed lookup is never an error; the provider simply has no path.

use std::path::PathBuf;

use walkdir::WalkDir;

pub trait SourceLocator: Send + Sync {
    /// Source file declaring `type_name`, if one can be found.
    fn locate(&self, type_name: &str) -> Option<PathBuf>;
}

/// Finds `<snake_case(TypeName)>.rs` under a set of source roots.
#[derive(Debug, Clone, Default)]
pub struct SourceTreeLocator {
    roots: Vec<PathBuf>,
}

impl SourceTreeLocator {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }
}

impl SourceLocator for SourceTreeLocator {
    fn locate(&self, type_name: &str) -> Option<PathBuf> {
        let wanted = file_stem_for(type_name)?;
        self.roots.iter().find_map(|root| {
            WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .find(|entry| {
                    let path = entry.path();
                    path.extension().is_some_and(|ext| ext == "rs")
                        && path.file_stem().is_some_and(|stem| stem == wanted.as_str())
                })
                .map(|entry| entry.into_path())
        })
    }
}

/// `crate::patches::GridOverlay<T>` -> `grid_overlay`
fn file_stem_for(type_name: &str) -> Option<String> {
    let base = type_name.split('<').next().unwrap_or(type_name);
    let last = base.rsplit("::").next().unwrap_or(base).trim();
    if last.is_empty() {
        return None;
    }
    Some(to_snake_case(last))
}

fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

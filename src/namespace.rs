//! Key names of the structures that back tagging.
//!
//! Every structure lives under a mode segment (`_any` or `_all`), so the two invalidation modes
//! never share a key even for identically named tags. Methods ending in `_id` return keys as passed
//! to direct commands, which the [`Transport`](crate::transport::Transport) prefixes itself.
//! Methods ending in `_key` (and [`KeyNamespace::scan_pattern`]) return full keys with the prefix
//! applied, for script arguments and scan patterns.
//!
//! | structure      | id                          | type       |
//! |----------------|-----------------------------|------------|
//! | tag entries    | `_any:tag:<tag>:entries`    | hash       |
//! | tag version    | `_all:tag:<tag>:version`    | string     |
//! | reverse index  | `_any:key:<key>:tags`       | hash       |
//! | registry       | `_any:registry`             | sorted set |
//! | tagged entry   | `_all:<discriminator>:<key>`| string     |

const TAG: &str = "tag:";
const ENTRIES: &str = ":entries";

/// Key builder for one invalidation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyNamespace {
    segment: &'static str,
}

impl KeyNamespace {
    /// Namespace of [`AnyMode`](crate::mode::AnyMode).
    pub const ANY: Self = Self { segment: "_any" };
    /// Namespace of [`AllMode`](crate::mode::AllMode).
    pub const ALL: Self = Self { segment: "_all" };

    /// Mode-specific identifier of a tag.
    pub fn tag_id(&self, tag: &str) -> String {
        format!("{}:{TAG}{tag}", self.segment)
    }

    /// Id of a tag's entries hash.
    pub fn tag_entries_id(&self, tag: &str) -> String {
        format!("{}{ENTRIES}", self.tag_id(tag))
    }

    /// Full key of a tag's entries hash.
    ///
    /// ```
    /// # use tagcache::namespace::KeyNamespace;
    /// assert_eq!(KeyNamespace::ANY.tag_key("app:", "users"), "app:_any:tag:users:entries");
    /// ```
    pub fn tag_key(&self, prefix: &str, tag: &str) -> String {
        format!("{prefix}{}", self.tag_entries_id(tag))
    }

    /// The text before and after the tag name in [`tag_key`](Self::tag_key), for scripts that
    /// assemble tag keys from tag names.
    pub fn tag_key_parts(&self, prefix: &str) -> (String, &'static str) {
        (format!("{prefix}{}:{TAG}", self.segment), ENTRIES)
    }

    /// Id of the string holding a tag's current version.
    pub fn tag_version_id(&self, tag: &str) -> String {
        format!("{}:version", self.tag_id(tag))
    }

    /// Id of the hash recording which tags a cache key belongs to.
    pub fn reverse_index_id(&self, key: &str) -> String {
        format!("{}:key:{key}:tags", self.segment)
    }

    /// Full key of a cache key's reverse index.
    pub fn reverse_index_key(&self, prefix: &str, key: &str) -> String {
        format!("{prefix}{}", self.reverse_index_id(key))
    }

    /// Id of the registry of known tags.
    pub fn registry_id(&self) -> String {
        format!("{}:registry", self.segment)
    }

    /// Full key of the registry of known tags.
    pub fn registry_key(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.registry_id())
    }

    /// Glob matching the full key of every tag entries hash.
    ///
    /// Glob metacharacters inside `prefix` are not escaped.
    pub fn scan_pattern(&self, prefix: &str) -> String {
        format!("{prefix}{}:{TAG}*{ENTRIES}", self.segment)
    }

    /// Recover the tag name from an entries id (as yielded by a prefix-stripping scan).
    pub fn tag_from_entries_id<'a>(&self, id: &'a str) -> Option<&'a str> {
        id.strip_prefix(self.segment)?
            .strip_prefix(':')?
            .strip_prefix(TAG)?
            .strip_suffix(ENTRIES)
    }

    /// Id of an entry stored under a tag-set discriminator.
    pub fn entry_id(&self, discriminator: &str, key: &str) -> String {
        format!("{}:{discriminator}:{key}", self.segment)
    }

    /// Recover the discriminator from an [`entry_id`](Self::entry_id).
    pub fn entry_discriminator<'a>(&self, id: &'a str) -> Option<&'a str> {
        let (discriminator, _) = id.strip_prefix(self.segment)?.strip_prefix(':')?.split_once(':')?;
        Some(discriminator)
    }
}

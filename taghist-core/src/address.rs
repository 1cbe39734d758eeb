use dashmap::DashMap;

/// Data kind encoded in a tag name's address part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// Single bit (`DBX`), requires an explicit `.bit` component.
    Bit,
    /// Raw byte (`DBB`).
    Byte,
    /// Big-endian signed 16-bit integer (`DBW`).
    Int16,
    /// Big-endian signed 32-bit integer (`DBD`).
    Int32,
}

impl AddressKind {
    #[inline]
    pub fn size_bytes(self) -> u32 {
        match self {
            AddressKind::Bit | AddressKind::Byte => 1,
            AddressKind::Int16 => 2,
            AddressKind::Int32 => 4,
        }
    }
}

/// Pre-parsed device memory address of one tag, derived once per distinct
/// tag name and immutable after that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagAddress {
    /// Key of the source controller this tag lives on.
    pub source_key: String,
    /// Data block number.
    pub block: u16,
    /// Byte offset within the block.
    pub byte_offset: u32,
    /// Data kind at that offset.
    pub kind: AddressKind,
    /// Bit position 0..=7 for `Bit` addresses, MSB-first.
    pub bit_index: Option<u8>,
}

impl TagAddress {
    #[inline]
    pub fn size_bytes(&self) -> u32 {
        self.kind.size_bytes()
    }

    /// Exclusive end offset of this tag's byte range.
    #[inline]
    pub fn end_offset(&self) -> u32 {
        self.byte_offset + self.size_bytes()
    }
}

/// Parse a tag name of the form `{sourceKey}_DB{block}.{KIND}{offset}[.{bit}]`
/// with KIND one of DBX/DBB/DBW/DBD, case-insensitive.
///
/// Returns `None` for any non-conforming string and for source keys the
/// given lookup does not know. Never panics, never errors.
pub fn parse_tag_address(name: &str, has_source: impl Fn(&str) -> bool) -> Option<TagAddress> {
    let upper = name.to_ascii_uppercase();
    // The source key is everything before the last "_DB"; keys themselves
    // may contain underscores.
    let split = upper.rfind("_DB")?;
    if split == 0 {
        return None;
    }
    let source_key = &name[..split];
    let rest = &upper[split + 3..];

    let (block_part, tail) = rest.split_once('.')?;
    let block: u16 = parse_digits(block_part)?;

    let tail = tail.strip_prefix("DB")?;
    let kind = match *tail.as_bytes().first()? {
        b'X' => AddressKind::Bit,
        b'B' => AddressKind::Byte,
        b'W' => AddressKind::Int16,
        b'D' => AddressKind::Int32,
        _ => return None,
    };
    let numbers = &tail[1..];

    let (byte_offset, bit_index) = match kind {
        AddressKind::Bit => {
            let (offset_part, bit_part) = numbers.split_once('.')?;
            let offset: u32 = parse_digits(offset_part)?;
            let bit: u8 = parse_digits(bit_part)?;
            if bit > 7 {
                return None;
            }
            (offset, Some(bit))
        }
        _ => {
            if numbers.contains('.') {
                return None;
            }
            (parse_digits(numbers)?, None)
        }
    };

    if !has_source(source_key) {
        return None;
    }

    Some(TagAddress {
        source_key: source_key.to_string(),
        block,
        byte_offset,
        kind,
        bit_index,
    })
}

#[inline]
fn parse_digits<T: std::str::FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Per-tag-name cache over `parse_tag_address`.
///
/// Parse misses are cached too: a non-conforming name stays excluded from
/// polling until a session (re)registers it, which invalidates its entry.
#[derive(Default)]
pub struct AddressCache {
    entries: DashMap<String, Option<TagAddress>>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached parse of `name`, consulting `has_source` on a cache miss.
    pub fn resolve(
        &self,
        name: &str,
        has_source: impl Fn(&str) -> bool,
    ) -> Option<TagAddress> {
        if let Some(hit) = self.entries.get(name) {
            return hit.clone();
        }
        let parsed = parse_tag_address(name, has_source);
        self.entries.insert(name.to_string(), parsed.clone());
        parsed
    }

    /// Drop the cache entries for the given tag names so the next poll
    /// re-parses them against the current source registry.
    pub fn invalidate<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.entries.remove(name.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_source(_: &str) -> bool {
        true
    }

    #[test]
    fn parses_word_address() {
        let a = parse_tag_address("A01_DB10.DBW2", any_source).unwrap();
        assert_eq!(a.source_key, "A01");
        assert_eq!(a.block, 10);
        assert_eq!(a.byte_offset, 2);
        assert_eq!(a.kind, AddressKind::Int16);
        assert_eq!(a.bit_index, None);
        assert_eq!(a.size_bytes(), 2);
    }

    #[test]
    fn parses_all_kinds_case_insensitively() {
        let x = parse_tag_address("a01_db1.dbx0.3", any_source).unwrap();
        assert_eq!(x.kind, AddressKind::Bit);
        assert_eq!(x.bit_index, Some(3));

        let b = parse_tag_address("A01_DB1.dbb7", any_source).unwrap();
        assert_eq!(b.kind, AddressKind::Byte);
        assert_eq!(b.byte_offset, 7);

        let d = parse_tag_address("A01_DB1.DBD100", any_source).unwrap();
        assert_eq!(d.kind, AddressKind::Int32);
        assert_eq!(d.size_bytes(), 4);
    }

    #[test]
    fn source_key_may_contain_underscores() {
        let a = parse_tag_address("Plant_West_DB2.DBW0", any_source).unwrap();
        assert_eq!(a.source_key, "Plant_West");
        assert_eq!(a.block, 2);
    }

    #[test]
    fn rejects_non_conforming_strings() {
        for bad in [
            "",
            "A01",
            "A01_DB",
            "A01_DB10",
            "A01_DB10.",
            "A01_DB10.DBQ2",
            "A01_DB10.DBW",
            "A01_DB10.DBW2.1", // dot not allowed for non-bit kinds
            "A01_DB10.DBX2",   // bit requires .bit
            "A01_DB10.DBX2.8", // bit out of range
            "A01_DBx.DBW2",    // non-numeric block
            "A01_DB10.DBW-2",
            "_DB10.DBW2", // empty source key
        ] {
            assert!(
                parse_tag_address(bad, any_source).is_none(),
                "expected None for {bad:?}"
            );
        }
    }

    #[test]
    fn unknown_source_yields_none() {
        assert!(parse_tag_address("A01_DB10.DBW2", |_| false).is_none());
    }

    #[test]
    fn parse_is_deterministic_and_idempotent() {
        let first = parse_tag_address("A01_DB10.DBW2", any_source);
        for _ in 0..3 {
            assert_eq!(parse_tag_address("A01_DB10.DBW2", any_source), first);
        }
    }

    #[test]
    fn cache_misses_stick_until_invalidated() {
        let cache = AddressCache::new();
        // First resolve: source unknown, miss cached.
        assert!(cache.resolve("A01_DB10.DBW2", |_| false).is_none());
        // Source registry now knows the key, but the cached miss wins.
        assert!(cache.resolve("A01_DB10.DBW2", |_| true).is_none());
        // Re-registration invalidates; the next resolve sees the new registry.
        cache.invalidate(["A01_DB10.DBW2"]);
        assert!(cache.resolve("A01_DB10.DBW2", |_| true).is_some());
    }
}

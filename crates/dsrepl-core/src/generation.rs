//! Generation IDs: dataset fingerprints used to detect diverged replicas

/// Generation ID of a domain holding no entries
pub const EMPTY_GENERATION_ID: u64 = 48;

/// Number of leading entries that contribute to the fingerprint
pub const GENERATION_SAMPLE: usize = 1000;

/// Fingerprint a dataset from its exported entries, in export order
///
/// The low 32 bits are the CRC32 of the first [`GENERATION_SAMPLE`] entries,
/// the high 32 bits their count.
pub fn compute<I, E>(entries: I) -> u64
where
    I: IntoIterator<Item = E>,
    E: AsRef<[u8]>,
{
    let mut hasher = crc32fast::Hasher::new();
    let mut count: u64 = 0;
    for entry in entries.into_iter().take(GENERATION_SAMPLE) {
        hasher.update(entry.as_ref());
        count += 1;
    }
    if count == 0 {
        return EMPTY_GENERATION_ID;
    }
    (count << 32) | u64::from(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_dataset() {
        assert_eq!(compute(Vec::<Vec<u8>>::new()), EMPTY_GENERATION_ID);
    }

    #[test]
    fn test_content_sensitive() {
        let a = compute(["dn: o=test", "dn: uid=a,o=test"]);
        let b = compute(["dn: o=test", "dn: uid=b,o=test"]);
        assert_ne!(a, b);
        assert_eq!(a >> 32, 2);
        assert_eq!(a, compute(["dn: o=test", "dn: uid=a,o=test"]));
    }

    #[test]
    fn test_only_sample_counts() {
        let base: Vec<String> = (0..GENERATION_SAMPLE).map(|i| format!("entry {i}")).collect();
        let mut longer = base.clone();
        longer.push("tail".to_string());
        assert_eq!(compute(&base), compute(&longer));
    }
}

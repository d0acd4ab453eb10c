use flate2::Compression;

/// Compression applied to a record's payload, stored as the byte after the
/// record length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionScheme {
    /// Legacy gzip-wrapped records. Read-only.
    Gzip,
    /// zlib-wrapped deflate, used for every record this crate writes.
    Deflate,
    /// Any other tag byte. Records carrying it are treated as absent.
    Unknown(u8),
}

impl CompressionScheme {
    pub const GZIP_TAG: u8 = 1;
    pub const DEFLATE_TAG: u8 = 2;

    pub fn tag(&self) -> u8 {
        match self {
            CompressionScheme::Gzip => Self::GZIP_TAG,
            CompressionScheme::Deflate => Self::DEFLATE_TAG,
            CompressionScheme::Unknown(tag) => *tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, CompressionScheme::Unknown(_))
    }

    /// Deflate settings for new records at the given level.
    pub fn level(level: u32) -> Compression {
        Compression::new(level.min(9))
    }
}

impl From<u8> for CompressionScheme {
    fn from(tag: u8) -> Self {
        match tag {
            Self::GZIP_TAG => CompressionScheme::Gzip,
            Self::DEFLATE_TAG => CompressionScheme::Deflate,
            other => CompressionScheme::Unknown(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_tags() {
        assert_eq!(CompressionScheme::from(1), CompressionScheme::Gzip);
        assert_eq!(CompressionScheme::from(2), CompressionScheme::Deflate);
        assert_eq!(CompressionScheme::Deflate.tag(), 2);
        assert!(CompressionScheme::Gzip.is_known());
    }

    #[test]
    fn test_unknown_tags_are_preserved() {
        for tag in [0u8, 3, 127, 255] {
            let scheme = CompressionScheme::from(tag);
            assert_eq!(scheme, CompressionScheme::Unknown(tag));
            assert!(!scheme.is_known());
            assert_eq!(scheme.tag(), tag);
        }
    }
}

//! Architecture independent memory attributes.

/// The access and cache attribute a region is mapped with.
///
/// This only becomes bits at the moment a leaf is written, see
/// [`Architecture::leaf_flags`](crate::Architecture::leaf_flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Normal memory, write-back cacheable, inner shareable, read/write/execute.
    WriteBack,
    /// Like [`Attribute::WriteBack`] but not shareable with other observers.
    WriteBackNonShareable,
    /// Write-back cacheable, read only.
    WriteBackReadOnly,
    /// Write-back cacheable, never executable.
    WriteBackExecuteNever,
    /// Normal memory, write-through cacheable.
    WriteThrough,
    /// Uncached but writes may be combined. Mostly reported by the x86 MTRRs.
    WriteCombining,
    /// Cached reads, uncached writes. Only reported by the x86 MTRRs.
    WriteProtected,
    /// Device memory: strongly ordered, uncached, never executable.
    Device,
    /// Normal memory that is neither cached nor buffered.
    Uncached,
}

/// The caching policy half of an [`Attribute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheType {
    /// No caching at all.
    Uncacheable,
    /// Uncached, with write combining.
    WriteCombining,
    /// Reads cached, writes go straight through.
    WriteThrough,
    /// Reads cached, writes uncached.
    WriteProtected,
    /// Fully cached.
    WriteBack,
}

impl CacheType {
    // Higher means stricter.
    const fn strictness(self) -> u8 {
        match self {
            CacheType::WriteBack => 0,
            CacheType::WriteProtected => 1,
            CacheType::WriteThrough => 2,
            CacheType::WriteCombining => 3,
            CacheType::Uncacheable => 4,
        }
    }

    /// Returns whichever of the two types caches less.
    pub const fn stricter(self, other: CacheType) -> CacheType {
        if other.strictness() > self.strictness() {
            other
        } else {
            self
        }
    }

    /// Decode an x86 memory type encoding (shared by the MTRRs and the PAT).
    ///
    /// Reserved encodings decode as [`CacheType::Uncacheable`].
    pub const fn from_x86(value: u8) -> CacheType {
        match value {
            0x01 => CacheType::WriteCombining,
            0x04 => CacheType::WriteThrough,
            0x05 => CacheType::WriteProtected,
            0x06 => CacheType::WriteBack,
            _ => CacheType::Uncacheable,
        }
    }

    /// The plain [`Attribute`] carrying this cache type and no extra permissions.
    pub const fn attribute(self) -> Attribute {
        match self {
            CacheType::Uncacheable => Attribute::Uncached,
            CacheType::WriteCombining => Attribute::WriteCombining,
            CacheType::WriteThrough => Attribute::WriteThrough,
            CacheType::WriteProtected => Attribute::WriteProtected,
            CacheType::WriteBack => Attribute::WriteBack,
        }
    }
}

impl Attribute {
    /// The cache policy of this attribute.
    pub const fn cache_type(self) -> CacheType {
        match self {
            Attribute::WriteBack
            | Attribute::WriteBackNonShareable
            | Attribute::WriteBackReadOnly
            | Attribute::WriteBackExecuteNever => CacheType::WriteBack,
            Attribute::WriteThrough => CacheType::WriteThrough,
            Attribute::WriteCombining => CacheType::WriteCombining,
            Attribute::WriteProtected => CacheType::WriteProtected,
            Attribute::Device | Attribute::Uncached => CacheType::Uncacheable,
        }
    }

    /// Returns true if writes must be refused.
    pub const fn is_read_only(self) -> bool {
        matches!(self, Attribute::WriteBackReadOnly)
    }

    /// Returns true if instruction fetches must be refused.
    pub const fn is_execute_never(self) -> bool {
        matches!(self, Attribute::WriteBackExecuteNever | Attribute::Device)
    }

    /// Returns true if the mapping is shared with other observers.
    pub const fn is_shareable(self) -> bool {
        !matches!(self, Attribute::WriteBackNonShareable)
    }
}

use derive_with::With;

#[derive(Debug, Clone, Copy, With)]
pub struct BufferPoolConfig {
    /// Size in bytes of one page, header included.
    pub page_size: usize,
    /// Number of pages the eviction policy keeps resident.
    pub eviction_limit: usize,
    /// How many pages the LRU policy reclaims at once when over the limit.
    pub evict_batch: usize,
}

impl BufferPoolConfig {
    /// Arena size: one spare chunk on top of the limit so an allocation can land
    /// before the policy picks its victims.
    pub fn arena_size(&self) -> usize {
        (self.eviction_limit + 1) * self.page_size
    }
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            page_size: 4096,
            eviction_limit: 5000,
            evict_batch: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, With)]
pub struct BTreeConfig {
    /// Render every touched page to the `trace` log.
    pub debug_page_dump: bool,
}

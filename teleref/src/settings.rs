use crate::CollectorKind;

/// Default capacity of the mirrored root table.
pub const MAX_ROOTS: usize = 4096;

// unset fields fall back to `TeleSettings::default()`
#[derive(Debug, Default, Clone)]
pub struct TeleCreateInfo {
    pub max_roots: Option<usize>,
    pub word_size: Option<usize>,
    // overrides the collector the target reports, mainly for replaying dumps
    pub collector: Option<CollectorKind>,
}

#[derive(Debug, Clone)]
pub struct TeleSettings {
    /// Upper bound on root slots. The effective capacity is the smaller of
    /// this and what the target reports.
    pub max_roots: usize,
    /// Stride of the mirrored root array in bytes.
    pub word_size: usize,
    pub collector: Option<CollectorKind>,
}

impl Default for TeleSettings {
    fn default() -> Self {
        Self {
            max_roots: MAX_ROOTS,
            word_size: 8,
            collector: None,
        }
    }
}

impl TeleSettings {
    pub fn from_info(info: &TeleCreateInfo) -> Result<Self, &'static str> {
        let mut settings = Self::default();
        info.max_roots.inspect(|&val| settings.max_roots = val);
        info.word_size.inspect(|&val| settings.word_size = val);
        if info.collector.is_some() {
            settings.collector = info.collector;
        }
        settings.validate()?;
        Ok(settings)
    }

    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_roots == 0 {
            return Err("max_roots must be > 0");
        }
        if self.max_roots > u32::MAX as usize {
            return Err("max_roots must fit in a u32 slot index");
        }
        if self.word_size != 4 && self.word_size != 8 {
            return Err("word_size must be 4 or 8");
        }
        Ok(())
    }
}

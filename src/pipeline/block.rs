use std::fmt;

/// Identity of one unit of work: a block of one subband.
///
/// Copied onto every transfer and launch so results and diagnostics can be
/// attributed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub block: u64,

    /// Index into the observation's subband list.
    pub global_subband: usize,

    /// Slot within the subbands handled by one `SubbandProc`.
    pub local_subband: usize,
}

impl BlockId {
    pub fn new(block: u64, global_subband: usize, local_subband: usize) -> Self {
        Self {
            block,
            global_subband,
            local_subband,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block {} subband {} (local {})",
            self.block, self.global_subband, self.local_subband
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let id = BlockId::new(7, 12, 2);
        assert_eq!(id.to_string(), "block 7 subband 12 (local 2)");
        assert_eq!(BlockId::default(), BlockId::new(0, 0, 0));
    }
}

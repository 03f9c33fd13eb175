use crate::device::DeviceError;

/// Engine error taxonomy.
///
/// Every public operation reports exactly one of these. `Eof` doubles as
/// the expected end sentinel of directory read loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    /// Probe or BPB/FSInfo validation failed; no state was changed.
    NoFat,
    /// On-disk invariants violated mid-operation. The volume should be
    /// treated as corrupted.
    Broken,
    /// The device adapter failed a sector transfer.
    Io,
    /// A caller-supplied argument violated a precondition.
    Param,
    /// The path is malformed or a component does not exist.
    Path,
    /// End of directory or end of file.
    Eof,
    /// The operation is not permitted on this entry or handle.
    Denied,
    /// No free cluster left on the volume.
    Full,
}

impl FsError {
    /// Stable negative code, compatible with the traditional C surface.
    pub fn code(self) -> i32 {
        match self {
            FsError::NoFat => -1,
            FsError::Broken => -2,
            FsError::Io => -3,
            FsError::Param => -4,
            FsError::Path => -5,
            FsError::Eof => -6,
            FsError::Denied => -7,
            FsError::Full => -8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FsError::NoFat => "NOFAT",
            FsError::Broken => "BROKEN",
            FsError::Io => "IO",
            FsError::Param => "PARAM",
            FsError::Path => "PATH",
            FsError::Eof => "EOF",
            FsError::Denied => "DENIED",
            FsError::Full => "FULL",
        }
    }

    /// Maps a numeric code back to its name. Code 0 is "NONE" (success).
    pub fn describe(code: i32) -> &'static str {
        match code {
            0 => "NONE",
            -1 => "NOFAT",
            -2 => "BROKEN",
            -3 => "IO",
            -4 => "PARAM",
            -5 => "PATH",
            -6 => "EOF",
            -7 => "DENIED",
            -8 => "FULL",
            _ => "NULL",
        }
    }
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<DeviceError> for FsError {
    fn from(_: DeviceError) -> Self {
        FsError::Io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(FsError::NoFat.code(), -1);
        assert_eq!(FsError::Full.code(), -8);
        assert_eq!(FsError::Denied.code(), -7);
    }

    #[test]
    fn describe_covers_none_and_unknown() {
        assert_eq!(FsError::describe(0), "NONE");
        assert_eq!(FsError::describe(-5), "PATH");
        assert_eq!(FsError::describe(-99), "NULL");
        assert_eq!(FsError::describe(1), "NULL");
    }

    #[test]
    fn describe_matches_code() {
        for err in [
            FsError::NoFat,
            FsError::Broken,
            FsError::Io,
            FsError::Param,
            FsError::Path,
            FsError::Eof,
            FsError::Denied,
            FsError::Full,
        ] {
            assert_eq!(FsError::describe(err.code()), err.name());
        }
    }
}

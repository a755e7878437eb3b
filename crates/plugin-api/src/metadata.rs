//! ABI version negotiation between the host and native plugin libraries.

use abi_stable::StableAbi;

/// Version of the native plugin ABI.
///
/// A library is compatible with the host when both share the same major
/// version and the library's minor version is not newer than the host's.
#[repr(C)]
#[derive(StableAbi, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AbiVersion {
    /// Incremented on breaking changes to the root module layout.
    pub major: u32,
    /// Incremented when functions are appended to the root module.
    pub minor: u32,
}

impl AbiVersion {
    /// The ABI version this host was compiled with.
    pub const CURRENT: AbiVersion = AbiVersion { major: 1, minor: 0 };

    /// Creates a version from its parts.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Returns true if a library built against `self` can be used by `host`.
    pub fn is_compatible_with(&self, host: &AbiVersion) -> bool {
        self.major == host.major && self.minor <= host.minor
    }
}

impl std::fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

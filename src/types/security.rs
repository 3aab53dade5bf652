//! Link security levels as reported by the bearer transport.

/// Security level of the underlying link.
///
/// Ordering follows strength: `None < Low < Medium < High < Fips`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityLevel {
    /// No security.
    None,
    /// Unauthenticated pairing without encryption.
    Low,
    /// Unauthenticated pairing with encryption.
    Medium,
    /// Authenticated pairing with encryption.
    High,
    /// Authenticated LE Secure Connections pairing with a FIPS approved
    /// algorithm set.
    Fips,
}

impl SecurityLevel {
    /// Whether the link is encrypted.
    pub fn encrypted(&self) -> bool {
        *self >= SecurityLevel::Medium
    }

    /// Whether the link is authenticated (MITM protected).
    pub fn authenticated(&self) -> bool {
        *self >= SecurityLevel::High
    }
}

//! The `TPM2_ST_*` structure tags. These are only used to name packets in logs; the framer never
//! rejects a packet because of its tag.

use std::fmt;

macro_rules! structure_tags {
    ($($variant:ident = $value:literal => $name:literal,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum StructureTag {
            $($variant = $value,)*
        }

        impl StructureTag {
            pub const fn from_u16(value: u16) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)*
                    _ => None,
                }
            }

            pub const fn into_u16(self) -> u16 {
                self as u16
            }

            /// The name this tag has in the TPM2 specification.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }
    };
}

structure_tags! {
    RspCommand = 0x00C4 => "TPM2_ST_RSP_COMMAND",
    Null = 0x8000 => "TPM2_ST_NULL",
    NoSessions = 0x8001 => "TPM2_ST_NO_SESSIONS",
    Sessions = 0x8002 => "TPM2_ST_SESSIONS",
    Reserved1 = 0x8003 => "TPM2_ST_RESERVED1",
    Reserved2 = 0x8004 => "TPM2_ST_RESERVED2",
    AttestNv = 0x8014 => "TPM2_ST_ATTEST_NV",
    AttestCommandAudit = 0x8015 => "TPM2_ST_ATTEST_COMMAND_AUDIT",
    AttestSessionAudit = 0x8016 => "TPM2_ST_ATTEST_SESSION_AUDIT",
    AttestCertify = 0x8017 => "TPM2_ST_ATTEST_CERTIFY",
    AttestQuote = 0x8018 => "TPM2_ST_ATTEST_QUOTE",
    AttestTime = 0x8019 => "TPM2_ST_ATTEST_TIME",
    AttestCreation = 0x801A => "TPM2_ST_ATTEST_CREATION",
    Reserved3 = 0x801B => "TPM2_ST_RESERVED3",
    Creation = 0x8021 => "TPM2_ST_CREATION",
    Verified = 0x8022 => "TPM2_ST_VERIFIED",
    AuthSecret = 0x8023 => "TPM2_ST_AUTH_SECRET",
    Hashcheck = 0x8024 => "TPM2_ST_HASHCHECK",
    AuthSigned = 0x8025 => "TPM2_ST_AUTH_SIGNED",
    FuManifest = 0x8029 => "TPM2_ST_FU_MANIFEST",
}

impl fmt::Display for StructureTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

//! Fixed-width wire integers for zerocopy.
//!
//! PostgreSQL and DRDA are big-endian, MySQL is little-endian.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

macro_rules! wire_int {
    ($(#[$doc:meta])* $name:ident, $native:ty, $len:expr, $from:ident, $to:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
        #[repr(C)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const fn new(value: $native) -> Self {
                Self(value.$to())
            }

            pub const fn get(self) -> $native {
                <$native>::$from(self.0)
            }
        }

        impl From<$name> for $native {
            fn from(value: $name) -> Self {
                value.get()
            }
        }
    };
}

wire_int!(
    /// Big-endian 16-bit unsigned integer.
    U16BE, u16, 2, from_be_bytes, to_be_bytes
);
wire_int!(
    /// Big-endian 16-bit signed integer.
    I16BE, i16, 2, from_be_bytes, to_be_bytes
);
wire_int!(
    /// Big-endian 32-bit unsigned integer.
    U32BE, u32, 4, from_be_bytes, to_be_bytes
);
wire_int!(
    /// Big-endian 32-bit signed integer.
    I32BE, i32, 4, from_be_bytes, to_be_bytes
);
wire_int!(
    /// Little-endian 16-bit unsigned integer.
    U16LE, u16, 2, from_le_bytes, to_le_bytes
);
wire_int!(
    /// Little-endian 32-bit unsigned integer.
    U32LE, u32, 4, from_le_bytes, to_le_bytes
);
wire_int!(
    /// Little-endian 64-bit unsigned integer.
    U64LE, u64, 8, from_le_bytes, to_le_bytes
);

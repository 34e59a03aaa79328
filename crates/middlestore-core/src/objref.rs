//! Packed object references.
//!
//! A reference to a persistent object is stored as one 64-bit integer: the
//! class id in the high 32 bits and the serial number in the low 32 bits.
//! `0` is the null reference.

use std::fmt;

use crate::error::{Error, ObjRefError};

/// A packed `(class id, serial number)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ObjRef(u64);

impl ObjRef {
    /// The null reference.
    pub const NULL: ObjRef = ObjRef(0);

    /// Pack a class id and serial number.
    pub const fn join(klass_id: u32, serial_num: u32) -> Self {
        ObjRef(((klass_id as u64) << 32) | serial_num as u64)
    }

    /// Unpack into `(class id, serial number)`.
    pub const fn split(self) -> (u32, u32) {
        ((self.0 >> 32) as u32, (self.0 & 0xFFFF_FFFF) as u32)
    }

    pub const fn from_u64(raw: u64) -> Self {
        ObjRef(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Reinterpret a signed 64-bit column value (bit-for-bit).
    pub const fn from_i64(raw: i64) -> Self {
        ObjRef(raw as u64)
    }

    /// Bit-for-bit signed form for storage in a signed 64-bit column.
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn klass_id(self) -> u32 {
        self.split().0
    }

    pub const fn serial_num(self) -> u32 {
        self.split().1
    }

    /// Check that a non-null reference has both components set.
    pub fn validate(self) -> Result<(u32, u32), Error> {
        let (klass_id, serial_num) = self.split();
        if klass_id == 0 || serial_num == 0 {
            return Err(Error::ObjRefZeroSerialNum(ObjRefError {
                obj_ref: self,
                klass_id,
                serial_num,
            }));
        }
        Ok((klass_id, serial_num))
    }

    /// Error for a well-formed reference whose target does not exist.
    pub fn dangling(self) -> Error {
        let (klass_id, serial_num) = self.split();
        Error::ObjRefDangles(ObjRefError {
            obj_ref: self,
            klass_id,
            serial_num,
        })
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (klass_id, serial_num) = self.split();
        write!(f, "{klass_id}.{serial_num}")
    }
}

impl From<u64> for ObjRef {
    fn from(raw: u64) -> Self {
        ObjRef(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_join_layout() {
        assert_eq!(ObjRef::join(1, 1).as_u64(), (1 << 32) | 1);
        assert_eq!(ObjRef::join(0, 0), ObjRef::NULL);
        assert_eq!(ObjRef::join(u32::MAX, u32::MAX).as_u64(), u64::MAX);
    }

    #[test]
    fn test_signed_storage_is_lossless() {
        let r = ObjRef::join(0x8000_0001, 7);
        assert!(r.as_i64() < 0);
        assert_eq!(ObjRef::from_i64(r.as_i64()), r);
    }

    #[test]
    fn test_validate_zero_components() {
        assert!(ObjRef::join(4, 12).validate().is_ok());
        assert!(matches!(
            ObjRef::join(4, 0).validate(),
            Err(Error::ObjRefZeroSerialNum(_))
        ));
        assert!(matches!(
            ObjRef::join(0, 5).validate(),
            Err(Error::ObjRefZeroSerialNum(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(ObjRef::join(2, 40).to_string(), "2.40");
    }

    proptest! {
        #[test]
        fn split_inverts_join(klass_id in any::<u32>(), serial in any::<u32>()) {
            prop_assert_eq!(ObjRef::join(klass_id, serial).split(), (klass_id, serial));
        }
    }
}

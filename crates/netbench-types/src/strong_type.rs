/// Declare a strongly-typed newtype around an integer.
///
/// The generated type derives the usual value traits, serializes
/// transparently, derefs to the inner value and converts both ways. It also
/// gets an `index()` accessor so ids can address slices directly.
#[macro_export]
macro_rules! strong_type {
    ($(#[$meta:meta])* $name:ident, $inner:ty) => {
        $(#[$meta])*
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            #[inline]
            pub const fn new(val: $inner) -> Self {
                Self(val)
            }

            /// The value as a `usize`, for indexing per-id tables.
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = $inner;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(val: $inner) -> Self {
                Self(val)
            }
        }

        impl From<$name> for $inner {
            #[inline]
            fn from(val: $name) -> Self {
                val.0
            }
        }
    };
}

#[cfg(test)]
mod tests {
    strong_type!(
        /// Identifier used only by these tests.
        SlotId,
        u16
    );

    #[test]
    fn test_index_and_deref() {
        let id = SlotId::new(9);
        assert_eq!(id.index(), 9usize);
        assert_eq!(*id, 9u16);
    }

    #[test]
    fn test_conversions() {
        let id: SlotId = 300u16.into();
        let raw: u16 = id.into();
        assert_eq!(raw, 300);
    }

    #[test]
    fn test_formatting() {
        let id = SlotId(3);
        assert_eq!(id.to_string(), "3");
        assert_eq!(format!("{id:?}"), "SlotId(3)");
    }

    #[test]
    fn test_ordering_and_default() {
        assert!(SlotId(1) < SlotId(2));
        assert_eq!(SlotId::default(), SlotId(0));
    }

    #[test]
    fn test_transparent_serde() {
        let json = serde_json::to_string(&SlotId(17)).unwrap();
        assert_eq!(json, "17");
        let back: SlotId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SlotId(17));
    }
}

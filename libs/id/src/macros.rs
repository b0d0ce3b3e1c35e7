//! Macros for defining typed ID types.

/// Macro to define a typed, UUID v4 backed identifier.
///
/// This generates a newtype wrapper around UUID with:
/// - `new()` to generate a fresh random ID
/// - `parse()` with strict v4 / RFC 4122 validation
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations as the hyphenated string
///
/// # Example
///
/// ```ignore
/// define_uuid_id!(BuildId, "build");
///
/// let id = BuildId::new();
/// let parsed: BuildId = "85ffe8da-c82f-4035-86c5-9d2b5f42d6f5".parse()?;
/// ```
#[macro_export]
macro_rules! define_uuid_id {
    ($name:ident, $kind:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Uuid);

        impl $name {
            /// Human readable kind, used in error messages.
            pub const KIND: &'static str = $kind;

            /// Creates a new random ID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Uuid::new_v4())
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn uuid(&self) -> $crate::Uuid {
                self.0
            }

            /// Parses an ID from its hyphenated string form.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                if s.len() != 36 {
                    return Err($crate::IdError::InvalidLength { len: s.len() });
                }

                let uuid = $crate::Uuid::try_parse(s)
                    .map_err(|e| $crate::IdError::InvalidUuid(e.to_string()))?;

                if uuid.get_version_num() != 4 {
                    return Err($crate::IdError::InvalidVersion(uuid.get_version_num()));
                }
                if uuid.get_variant() != $crate::uuid_variant::RFC4122 {
                    return Err($crate::IdError::InvalidVariant);
                }

                Ok(Self(uuid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

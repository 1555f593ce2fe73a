//! String-keyed settings.
//!
//! Values are stored as text: numbers in their shortest round-trip form,
//! booleans as `1`/`0`, vectors as whitespace separated tuples and enums by
//! name. The file form is one `key=value` per line; `#` starts a comment.

use std::{collections::BTreeMap, fs, path::{Path, PathBuf}};

use glam::{Vec3, Vec4};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected `key=value`, got `{text}`")]
    Syntax { line: usize, text: String },
}

pub trait SettingValue: Sized {
    fn to_setting(&self) -> String;
    fn from_setting(text: &str) -> Option<Self>;
}

impl SettingValue for f32 {
    fn to_setting(&self) -> String {
        self.to_string()
    }

    fn from_setting(text: &str) -> Option<Self> {
        text.trim().parse().ok()
    }
}

impl SettingValue for u32 {
    fn to_setting(&self) -> String {
        self.to_string()
    }

    fn from_setting(text: &str) -> Option<Self> {
        text.trim().parse().ok()
    }
}

impl SettingValue for i32 {
    fn to_setting(&self) -> String {
        self.to_string()
    }

    fn from_setting(text: &str) -> Option<Self> {
        text.trim().parse().ok()
    }
}

impl SettingValue for bool {
    fn to_setting(&self) -> String {
        let text = if *self { "1" } else { "0" };
        text.to_owned()
    }

    fn from_setting(text: &str) -> Option<Self> {
        match text.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }
}

fn parse_tuple<const N: usize>(text: &str) -> Option<[f32; N]> {
    let mut out = [0.0; N];
    let mut parts = text.split_whitespace();
    for slot in out.iter_mut() {
        *slot = parts.next()?.parse().ok()?;
    }
    parts.next().is_none().then_some(out)
}

fn format_tuple(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

impl SettingValue for Vec3 {
    fn to_setting(&self) -> String {
        format_tuple(&self.to_array())
    }

    fn from_setting(text: &str) -> Option<Self> {
        parse_tuple::<3>(text).map(Vec3::from_array)
    }
}

impl SettingValue for Vec4 {
    fn to_setting(&self) -> String {
        format_tuple(&self.to_array())
    }

    fn from_setting(text: &str) -> Option<Self> {
        parse_tuple::<4>(text).map(Vec4::from_array)
    }
}

/// Implements [`SettingValue`] for an enum with `name()` and `from_name()`.
#[macro_export]
macro_rules! named_setting {
    ($ty:ty) => {
        impl $crate::settings::SettingValue for $ty {
            fn to_setting(&self) -> String {
                self.name().to_owned()
            }

            fn from_setting(text: &str) -> Option<Self> {
                <$ty>::from_name(text.trim())
            }
        }
    };
}

/// Declares a fieldless enum with stable setting names and wires it into
/// [`SettingValue`].
#[macro_export]
macro_rules! setting_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        $crate::named_setting!($name);
    };
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SettingsStore {
    values: BTreeMap<String, String>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set_raw(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn write<T: SettingValue>(&mut self, key: impl Into<String>, value: &T) {
        self.values.insert(key.into(), value.to_setting());
    }

    pub fn get<T: SettingValue>(&self, key: &str) -> Option<T> {
        let raw = self.values.get(key)?;
        let parsed = T::from_setting(raw);
        if parsed.is_none() {
            log::warn!("ignoring malformed setting {key}={raw}");
        }
        parsed
    }

    /// Overwrites `target` only when the key exists and parses.
    pub fn read<T: SettingValue>(&self, key: &str, target: &mut T) -> bool {
        match self.get(key) {
            Some(value) => {
                *target = value;
                true
            }
            None => false,
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.values {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, SettingsError> {
        let mut store = Self::new();
        for (index, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(SettingsError::Syntax {
                    line: index + 1,
                    text: trimmed.to_owned(),
                });
            };
            store.set_raw(key.trim(), value.trim());
        }
        Ok(store)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let path = path.as_ref();
        fs::write(path, self.to_text()).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub fn key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Objects whose editable fields round-trip through a [`SettingsStore`].
pub trait Persist {
    fn save_settings(&self, store: &mut SettingsStore, prefix: &str);
    /// Missing or malformed keys leave the current value in place.
    fn load_settings(&mut self, store: &SettingsStore, prefix: &str);
}

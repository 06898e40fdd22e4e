use std::fmt::{Debug, Display};
use std::io;
use std::path::PathBuf;

use serde::Serializer;

/// Serde yaml represents things differently than just "JSON in YAML format".
/// We don't want this. Instead, we transcode YAML through the JSON data model
/// so defaults, flattening and `deny_unknown_fields` behave identically for
/// both formats.
pub mod yamlviajson {
	use serde::{de, ser};

	pub fn from_str<T>(s: &str) -> anyhow::Result<T>
	where
		T: for<'de> de::Deserialize<'de>,
	{
		let value: serde_json::Value = serde_yaml::from_str(s)?;
		Ok(serde_json::from_value(value)?)
	}

	pub fn to_string<T>(value: &T) -> anyhow::Result<String>
	where
		T: ?Sized + ser::Serialize,
	{
		let js: serde_json::Value = serde_json::to_value(value)?;
		Ok(serde_yaml::to_string(&js)?)
	}
}

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == Default::default()
}

pub mod serde_dur {
	use duration_str::HumanFormat;
	pub use duration_str::deserialize_duration as deserialize;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&t.human_format())
	}
}

pub mod serde_dur_option {
	use duration_str::HumanFormat;
	pub use duration_str::deserialize_option_duration as deserialize;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(
		t: &Option<T>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match t {
			None => serializer.serialize_none(),
			Some(t) => serializer.serialize_str(&t.human_format()),
		}
	}
}

pub fn ser_display<S: Serializer, T: Display>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str(&t.to_string())
}

pub fn ser_display_option<S: Serializer, T: Display>(
	t: &Option<T>,
	serializer: S,
) -> Result<S::Ok, S::Error> {
	match t {
		None => serializer.serialize_none(),
		Some(t) => serializer.serialize_str(&t.to_string()),
	}
}

pub fn ser_debug<S: Serializer, T: Debug>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str(&format!("{t:?}"))
}

pub fn ser_redact<S: Serializer, T>(_t: &T, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str("<redacted>")
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub enum FileOrInline {
	File { file: PathBuf },
	Inline(String),
}

impl FileOrInline {
	pub fn load(&self) -> io::Result<String> {
		match self {
			FileOrInline::File { file } => std::fs::read_to_string(file),
			FileOrInline::Inline(s) => Ok(s.clone()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug, PartialEq, serde::Deserialize)]
	#[serde(rename_all = "camelCase", deny_unknown_fields)]
	struct Sample {
		name: String,
		#[serde(default)]
		count: u32,
	}

	#[test]
	fn yaml_goes_through_json_model() {
		let s: Sample = yamlviajson::from_str("name: a\ncount: 3\n").unwrap();
		assert_eq!(
			s,
			Sample {
				name: "a".to_string(),
				count: 3
			}
		);
	}

	#[test]
	fn unknown_fields_rejected() {
		assert!(yamlviajson::from_str::<Sample>("name: a\nbogus: 1\n").is_err());
	}
}

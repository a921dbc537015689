#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod error;
pub mod time;

/// Removes the first matching prefix from `value`, returning the input untouched
/// when none of the prefixes apply
pub fn strip_any_prefix<'value>(
	value: &'value str,
	prefixes: impl IntoIterator<Item = impl AsRef<str>>,
) -> &'value str {
	prefixes
		.into_iter()
		.find_map(|prefix| {
			let prefix = prefix.as_ref();
			(!prefix.is_empty())
				.then(|| value.strip_prefix(prefix))
				.flatten()
		})
		.unwrap_or(value)
}

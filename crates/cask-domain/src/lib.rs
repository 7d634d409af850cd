//! Identity, metadata, and wire types shared by every cask crate.

pub mod api;
pub mod error;
mod info;
mod module;
mod reference;
mod version;

pub use error::{codes, Error, Result};
pub use info::{Kind, PackageInfo};
pub use module::Module;
pub use reference::{Architecture, FuzzyReference, Reference};
pub use version::Version;

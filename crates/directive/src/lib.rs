//! Interpretation of raw model replies: the directive vocabulary, the extractor
//! that turns a reply into paced fragments plus actions, and the cleanup pass.

pub mod cleanup;
pub mod extractor;
pub mod split;
pub mod vocabulary;

pub use cleanup::cleanup;
pub use extractor::{
    Extraction, Extractor, ExtractorPolicy, Fragment, FragmentOrigin, PacingPolicy,
};
pub use split::{Boundary, split_prose};
pub use vocabulary::{Directive, DirectiveAction};

//! Use cases layered on the container model
//!
//! - [`lifecycle`] - copy, move, rename and delete with existence checks and
//!   listener notification, plus folder creation and refresh
//! - [`TreeBuilder`] - recursive remote-tree population and diffing

pub mod build_tree;
pub mod lifecycle;

pub use build_tree::TreeBuilder;

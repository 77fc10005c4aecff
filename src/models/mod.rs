//! Hand-written versionless models for the bootstrap classes: the ones that
//! must be readable before any streamer has been parsed, plus the read side
//! of everything this crate writes.

use std::collections::HashMap;

use crate::model::ClassDef;

pub mod hist;
pub mod list;
pub mod object;
pub mod reference;
pub mod tree;

pub(crate) fn bootstrap_classes() -> HashMap<String, ClassDef> {
    let mut classes = HashMap::new();
    object::register(&mut classes);
    list::register(&mut classes);
    reference::register(&mut classes);
    tree::register(&mut classes);
    hist::register(&mut classes);
    crate::streamers::register_bootstrap(&mut classes);
    classes
}

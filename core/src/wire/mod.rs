//! Wire and disk formats shared by both roles: the file list in both
//! flavors, the share manifest, and the UDP advert datagram.

pub mod advert;
pub mod filelist;
pub mod xml;

pub use advert::Advert;
pub use filelist::{FileList, Item};
pub use xml::ManifestShare;

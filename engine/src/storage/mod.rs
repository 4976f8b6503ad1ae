//! On-disk layout, settings and deployment records

pub mod layout;
pub mod records;
pub mod settings;

pub mod accounting;
pub mod share_crawler;
pub mod stats;

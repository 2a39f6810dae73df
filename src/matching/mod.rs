//! Turning OCR text and photos into advertisers, stations and lines.

pub mod advertiser;
pub mod line_color;
pub mod station;

pub use advertiser::{AdvertiserMatch, match_advertiser};
pub use line_color::line_from_image;
pub use station::{StationGuess, infer_station};

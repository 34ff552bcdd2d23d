pub mod csv;
pub mod logging;
pub mod points;

pub use points::{approx_eq, format_points, perc_to_points, points_to_perc, round2};

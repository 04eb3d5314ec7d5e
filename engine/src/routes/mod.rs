pub mod reports;

pub use reports::report_routes;

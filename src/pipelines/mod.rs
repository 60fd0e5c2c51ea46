pub mod barcode;
pub mod orchestrator;
pub mod params;
pub mod stages;

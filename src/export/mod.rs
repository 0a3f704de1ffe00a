pub mod alert;
pub mod csv_writer;

pub use alert::AlertLog;
pub use csv_writer::FlowCsvWriter;

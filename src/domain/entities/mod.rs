pub mod alert;
pub mod forecast;
pub mod raw_record;
pub mod report;
pub mod report_key;

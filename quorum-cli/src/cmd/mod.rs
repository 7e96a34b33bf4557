pub mod backup;
pub mod exclusion;

pub mod classes;
pub mod core;
pub mod results;
pub mod settings;
pub mod students;
pub mod subjects;

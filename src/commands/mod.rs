pub mod cleanup;
pub mod name;
pub mod run;

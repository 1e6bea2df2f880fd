pub mod release;
pub mod run;

pub mod hint;
pub mod num;

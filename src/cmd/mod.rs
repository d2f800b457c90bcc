pub mod decode;
pub mod encode;
pub mod rom;
pub mod sym;

pub mod candidate;
pub mod decision;
pub mod message;
pub mod quota;

/// Word count.
pub mod wc;

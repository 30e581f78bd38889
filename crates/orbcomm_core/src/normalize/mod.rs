pub mod markup;
pub mod timestamps;

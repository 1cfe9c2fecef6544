pub mod risingwave;
pub mod scale_view;

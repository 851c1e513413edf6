// Stock transaction manager and inventory glue
pub mod stock;

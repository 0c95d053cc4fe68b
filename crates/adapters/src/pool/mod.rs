pub mod static_address_pool;

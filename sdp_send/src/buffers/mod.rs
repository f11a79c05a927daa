pub mod send_buffer;
pub mod buffer_pool;

pub mod bus;
pub mod device;
pub mod port;
pub mod protocol;

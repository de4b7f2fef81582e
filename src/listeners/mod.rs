pub mod dns;
pub mod mysql;
pub mod wireguard;

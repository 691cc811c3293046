mod lifecycle;
mod peers;
mod workers;

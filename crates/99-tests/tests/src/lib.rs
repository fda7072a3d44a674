//! Cross-domain tests for the vchan handshake and lifecycle, run against the
//! loopback hypervisor.

#[cfg(test)]
mod support;

#[cfg(test)]
mod handshake;

#[cfg(test)]
mod lifecycle;

#[cfg(test)]
mod faults;

use std::borrow::Cow;

/// Expands the `":PORT"` shorthand to `"0.0.0.0:PORT"` so tokio can bind it.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    match addr.strip_prefix(':') {
        Some(port) => Cow::Owned(format!("0.0.0.0:{port}")),
        None => Cow::Borrowed(addr),
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_bind_addr;

    #[test]
    fn port_only_binds_all_interfaces() {
        assert_eq!(normalize_bind_addr(":2200").as_ref(), "0.0.0.0:2200");
        assert_eq!(normalize_bind_addr("  :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn full_addresses_pass_through() {
        assert_eq!(normalize_bind_addr("127.0.0.1:2200").as_ref(), "127.0.0.1:2200");
        assert_eq!(normalize_bind_addr("[::]:2200").as_ref(), "[::]:2200");
    }
}

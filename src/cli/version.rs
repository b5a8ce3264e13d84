/// Display version information
pub fn execute() {
    println!("resistnet {}", env!("CARGO_PKG_VERSION"));
    println!("Identity-gated publishing and coordination");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_execute() {
        execute();
    }
}

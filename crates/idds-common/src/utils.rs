//! Helpers de host/proceso usados por el heartbeat de salud.

/// FQDN local, con fallback al hostname corto.
pub fn hostname() -> String {
    std::env::var("HOSTNAME").ok()
                             .filter(|h| !h.is_empty())
                             .unwrap_or_else(|| "localhost".to_string())
}

pub fn pid() -> i32 {
    std::process::id() as i32
}

/// Comprueba si un pid sigue vivo en este host.
///
/// En Linux alcanza con mirar /proc; en otros sistemas se asume vivo (el
/// reaping por antigüedad sigue aplicando).
pub fn pid_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        true
    }
}

/// Particiona `items` en chunks de a lo sumo `size` elementos.
pub fn chunked<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    if size == 0 {
        return vec![items.to_vec()];
    }
    items.chunks(size).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_exists() {
        assert!(pid_exists(pid()));
        assert!(!pid_exists(-1));
    }

    #[test]
    fn chunking() {
        let items: Vec<i64> = (0..5).collect();
        let chunks = chunked(&items, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], vec![4]);
    }
}

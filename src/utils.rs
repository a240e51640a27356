use once_cell::sync::Lazy;
use std::sync::mpsc;

pub static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime")
});

pub fn spawn_async<F>(fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    RUNTIME.spawn(fut);
}

/// Runs `fut` on the background runtime and hands its result back over a channel,
/// so storage is only ever touched from the calling thread.
pub fn run_async_to_main<T, E, Fut>(fut: Fut) -> mpsc::Receiver<Result<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
    Fut: std::future::Future<Output = Result<T, E>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<T, E>>();
    spawn_async(async move {
        let res = fut.await;
        let _ = tx.send(res);
    });
    rx
}

/// Prepends `https://` to bare hosts. Links that already name a scheme are
/// left alone so callers can reject the ones they do not speak.
pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    let has_scheme = trimmed.split_once("://").is_some_and(|(scheme, _)| {
        !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    });
    if has_scheme {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_hosts_get_https() {
        assert_eq!(normalize_url(" files.example.com/a.csv "), "https://files.example.com/a.csv");
        assert_eq!(normalize_url("http://x.org/a.csv"), "http://x.org/a.csv");
        assert_eq!(normalize_url("x.org/go?to=http://y.org"), "https://x.org/go?to=http://y.org");
    }

    #[test]
    fn explicit_schemes_are_kept() {
        assert_eq!(normalize_url("ftp://host/x.csv"), "ftp://host/x.csv");
        assert_eq!(normalize_url("HTTPS://x.org/a.csv"), "HTTPS://x.org/a.csv");
    }

    #[test]
    fn background_result_reaches_the_caller() {
        let rx = run_async_to_main(async { Ok::<_, String>(41 + 1) });
        assert_eq!(rx.recv().unwrap(), Ok(42));
    }
}

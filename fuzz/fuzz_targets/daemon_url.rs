#![no_main]

use libfuzzer_sys::fuzz_target;
use mapepire_client::DaemonServer;

fuzz_target!(|data: &[u8]| {
    let Ok(url) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(server) = DaemonServer::from_url(url) {
        assert!(!server.host.is_empty());
        assert!(!server.user.is_empty());
        let endpoint = server.endpoint();
        let _ = endpoint.url();
        let _ = endpoint.basic_auth();
    }
});

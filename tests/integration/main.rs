//! Integration tests for Stowage

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    /// Command isolated from the user's config and cache
    fn stowage(home: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("stowage");
        cmd.env("STOWAGE_CONFIG", home.join("config.toml"))
            .env("STOWAGE_CACHE_ROOT", home.join("bundles"))
            .env("XDG_STATE_HOME", home.join("state"))
            .env_remove("STOWAGE_REGISTRY_USERNAME")
            .env_remove("STOWAGE_REGISTRY_PASSWORD");
        cmd
    }

    #[test]
    fn help_displays() {
        let home = TempDir::new().unwrap();
        stowage(home.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("content-addressed bundle unpack cache"));
    }

    #[test]
    fn version_displays() {
        let home = TempDir::new().unwrap();
        stowage(home.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("stowage"));
    }

    #[test]
    fn config_path() {
        let home = TempDir::new().unwrap();
        stowage(home.path())
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let home = TempDir::new().unwrap();
        stowage(home.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]").and(predicate::str::contains("[cache]")));
    }

    #[test]
    fn config_init_then_invalid_config_fails() {
        let home = TempDir::new().unwrap();
        stowage(home.path())
            .args(["config", "init"])
            .assert()
            .success();
        assert!(home.path().join("config.toml").exists());

        std::fs::write(home.path().join("config.toml"), "[fetch]\ntimeout_secs = \"x\"\n").unwrap();
        stowage(home.path())
            .args(["list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn list_empty() {
        let home = TempDir::new().unwrap();
        stowage(home.path())
            .args(["list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    fn cleanup_missing_bundle_succeeds() {
        let home = TempDir::new().unwrap();
        stowage(home.path())
            .args(["cleanup", "never-unpacked"])
            .assert()
            .success();
    }

    #[test]
    fn gc_rejects_malformed_digest() {
        let home = TempDir::new().unwrap();
        stowage(home.path())
            .args(["gc", "pkg-a", "--keep", "sha256:NOTHEX"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn unpack_rejects_unsafe_name() {
        let home = TempDir::new().unwrap();
        stowage(home.path())
            .args(["unpack", "--name", "../escape", "--tgz", "http://127.0.0.1:1/a.tgz"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
        assert!(!home.path().join("escape").exists());
    }

    #[test]
    fn unpack_rejects_non_http_url() {
        let home = TempDir::new().unwrap();
        stowage(home.path())
            .args(["unpack", "--name", "pkg-a", "--tgz", "file:///etc/passwd"])
            .assert()
            .failure();
    }
}

mod unpack_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use predicates::prelude::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::path::Path;
    use std::thread;
    use tempfile::TempDir;

    fn stowage(home: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("stowage");
        cmd.env("STOWAGE_CONFIG", home.join("config.toml"))
            .env("XDG_STATE_HOME", home.join("state"))
            .arg("--cache-root")
            .arg(home.join("bundles"));
        cmd
    }

    fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&builder.into_inner().unwrap()).unwrap();
        gz.finish().unwrap()
    }

    fn serve(body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                while reader.read_line(&mut line).is_ok() {
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    line.clear();
                }
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&body);
            }
        });
        format!("http://{}/bundle.tgz", addr)
    }

    #[test]
    fn unpack_gc_and_cleanup_lifecycle() {
        let home = TempDir::new().unwrap();
        let v1 = serve(tarball(&[("manifests/app.yaml", b"v1")]));
        let v2 = serve(tarball(&[("manifests/app.yaml", b"v2")]));

        let first = stowage(home.path())
            .args(["unpack", "--name", "pkg-a", "--tgz", &v1, "--format", "plain"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let first_path = String::from_utf8(first).unwrap().trim().to_string();
        assert_eq!(
            std::fs::read_to_string(Path::new(&first_path).join("manifests/app.yaml")).unwrap(),
            "v1"
        );

        stowage(home.path())
            .args(["unpack", "--name", "pkg-a", "--tgz", &v2, "--gc", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"state\": \"unpacked\""));
        assert!(!Path::new(&first_path).exists());

        stowage(home.path())
            .args(["list", "pkg-a", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("sha256:"));

        stowage(home.path())
            .args(["cleanup", "pkg-a"])
            .assert()
            .success();
        assert!(!home.path().join("bundles").join("pkg-a").exists());
    }

    #[test]
    fn audit_log_records_unpack() {
        let home = TempDir::new().unwrap();
        let url = serve(tarball(&[("a.txt", b"hello")]));

        stowage(home.path())
            .args(["unpack", "--name", "pkg-a", "--tgz", &url])
            .assert()
            .success();

        let log = std::fs::read_to_string(home.path().join("state/stowage/audit.log")).unwrap();
        assert!(log.contains("bundle.unpacked"));
    }
}

pub const SOUNDMESH_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Wire protocol revision advertised in logs and `--version` output.
pub const MESH_PROTOCOL_VERSION: u32 = 1;

pub fn git_commit_hash() -> &'static str {
    option_env!("GIT_COMMIT_HASH").unwrap_or("unknown")
}

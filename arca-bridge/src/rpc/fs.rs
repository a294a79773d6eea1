//! Filesystem service client (vsock 51821, per container).
//!
//! Backs archive copy in/out of a running container and upperdir
//! enumeration for commit-style diffs.

use super::{call, check_envelope};
use crate::vmm::VmHandle;
use arca_shared::constants::vsock;
use arca_shared::wire::{FsEntry, FsRequest, FsResponse, FsStat};
use arca_shared::{ArcaError, ArcaResult};
use std::sync::Arc;

pub struct FilesystemClient {
    vm: Arc<dyn VmHandle>,
}

impl FilesystemClient {
    pub fn new(vm: Arc<dyn VmHandle>) -> Self {
        Self { vm }
    }

    /// Flush guest page cache to the writable device.
    pub async fn sync_filesystem(&self) -> ArcaResult<()> {
        let resp: FsResponse =
            call(&self.vm, vsock::FILESYSTEM_PORT, &FsRequest::SyncFilesystem).await?;
        check_envelope(resp.success, resp.error, "SyncFilesystem")
    }

    /// Enumerate the overlay upperdir: everything the container changed.
    pub async fn enumerate_upperdir(&self) -> ArcaResult<Vec<FsEntry>> {
        let resp: FsResponse = call(
            &self.vm,
            vsock::FILESYSTEM_PORT,
            &FsRequest::EnumerateUpperdir,
        )
        .await?;
        check_envelope(resp.success, resp.error.clone(), "EnumerateUpperdir")?;
        Ok(resp.entries)
    }

    /// Read `path` out of the container as a tar stream plus its stat.
    pub async fn read_archive(&self, path: &str) -> ArcaResult<(Vec<u8>, FsStat)> {
        let resp: FsResponse = call(
            &self.vm,
            vsock::FILESYSTEM_PORT,
            &FsRequest::ReadArchive {
                path: path.to_string(),
            },
        )
        .await?;
        check_envelope(resp.success, resp.error.clone(), "ReadArchive")?;
        let stat = resp.stat.ok_or_else(|| {
            ArcaError::Remote("ReadArchive response carried no stat block".into())
        })?;
        Ok((resp.tar_data, stat))
    }

    /// Unpack a tar stream into the container at `path`.
    pub async fn write_archive(&self, path: &str, tar_data: Vec<u8>) -> ArcaResult<()> {
        let resp: FsResponse = call(
            &self.vm,
            vsock::FILESYSTEM_PORT,
            &FsRequest::WriteArchive {
                path: path.to_string(),
                tar_data,
            },
        )
        .await?;
        check_envelope(resp.success, resp.error, "WriteArchive")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::{GuestProcess, ProcessSpec, ProcessStdio, VmHandle, VsockStream};
    use arca_shared::ArcaError;
    use arca_shared::codec;
    use arca_shared::wire::FsEntryKind;
    use async_trait::async_trait;

    /// VM whose filesystem service answers from a canned script.
    struct FsServiceVm;

    #[async_trait]
    impl VmHandle for FsServiceVm {
        fn pid(&self) -> Option<u32> {
            Some(1)
        }
        async fn start(&self) -> ArcaResult<()> {
            Ok(())
        }
        async fn shutdown(&self) -> ArcaResult<()> {
            Ok(())
        }
        async fn kill(&self) -> ArcaResult<()> {
            Ok(())
        }
        async fn signal_init(&self, _signal: i32) -> ArcaResult<()> {
            Ok(())
        }
        async fn wait(&self) -> ArcaResult<i64> {
            Ok(0)
        }
        async fn connect_vsock(&self, port: u32) -> ArcaResult<Box<dyn VsockStream>> {
            assert_eq!(port, vsock::FILESYSTEM_PORT);
            let (near, mut far) = tokio::io::duplex(1 << 20);
            tokio::spawn(async move {
                while let Ok(req) = codec::read_frame::<_, FsRequest>(&mut far).await {
                    let resp = match req {
                        FsRequest::SyncFilesystem => FsResponse {
                            success: true,
                            ..Default::default()
                        },
                        FsRequest::EnumerateUpperdir => FsResponse {
                            success: true,
                            entries: vec![FsEntry {
                                path: "etc/motd".into(),
                                kind: FsEntryKind::File,
                                size: 13,
                                mtime: 1_700_000_000,
                                mode: 0o644,
                            }],
                            ..Default::default()
                        },
                        FsRequest::ReadArchive { path } => FsResponse {
                            success: true,
                            tar_data: b"tar-bytes".to_vec(),
                            stat: Some(FsStat {
                                name: path,
                                size: 9,
                                mode: 0o644,
                                mtime: 1_700_000_000,
                                link_target: None,
                            }),
                            ..Default::default()
                        },
                        FsRequest::WriteArchive { .. } => FsResponse {
                            success: false,
                            error: Some("read-only filesystem".into()),
                            ..Default::default()
                        },
                    };
                    if codec::write_frame(&mut far, &resp).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(near))
        }
        async fn spawn(
            &self,
            _spec: ProcessSpec,
        ) -> ArcaResult<(Box<dyn GuestProcess>, ProcessStdio)> {
            Err(ArcaError::Unsupported("no exec".into()))
        }
    }

    #[tokio::test]
    async fn round_trips_each_operation() {
        let client = FilesystemClient::new(Arc::new(FsServiceVm));

        client.sync_filesystem().await.unwrap();

        let entries = client.enumerate_upperdir().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, FsEntryKind::File);

        let (tar, stat) = client.read_archive("/etc/motd").await.unwrap();
        assert_eq!(tar, b"tar-bytes");
        assert_eq!(stat.name, "/etc/motd");

        let err = client.write_archive("/etc", vec![1, 2, 3]).await.unwrap_err();
        assert!(err.to_string().contains("read-only filesystem"));
    }
}

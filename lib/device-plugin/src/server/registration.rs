// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kubelet registration client over a Unix domain socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};

use crate::error::ServerError;

use super::proto::{registration_client::RegistrationClient, RegisterRequest};

/// Open a gRPC channel to a Unix socket. The URI is required by tonic and
/// otherwise ignored.
pub async fn connect_unix(
    path: &Path,
    timeout: Duration,
) -> Result<Channel, tonic::transport::Error> {
    let path: PathBuf = path.to_path_buf();
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_timeout(timeout)
        .connect_with_connector(tower::service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await?;
    Ok(channel)
}

/// Issue one `Register` call. The whole exchange is bounded by `timeout`.
pub async fn register(
    kubelet_socket: &Path,
    request: RegisterRequest,
    timeout: Duration,
) -> Result<(), ServerError> {
    let failed = |reason: String| ServerError::RegistrationFailed {
        socket: kubelet_socket.to_path_buf(),
        reason,
    };

    let call = async {
        let channel = connect_unix(kubelet_socket, timeout)
            .await
            .map_err(|e| failed(format!("connect: {e}")))?;
        RegistrationClient::new(channel)
            .register(request)
            .await
            .map_err(|status| failed(format!("{}: {}", status.code(), status.message())))?;
        Ok(())
    };

    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(failed(format!("timed out after {timeout:?}"))),
    }
}

use crate::core::upload::ObjectStore;
use crate::model::entities::RemoteEntity;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
    Client,
};
use aws_smithy_types::{body::SdkBody, byte_stream::ByteStream};
use hyper::Body;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

const MAX_KEYS_PER_DELETE: usize = 1000;

/// One configured remote: an aws-sdk client bound to a bucket. Credentials
/// and endpoint come from the config entity, falling back to the standard
/// environment/profile chain.
pub struct S3Service {
    client: Client,
    bucket: String,
}

impl S3Service {
    pub async fn connect(remote: &RemoteEntity) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(endpoint) = &remote.s3.endpoint {
            if let Some(profile) = &endpoint.profile_name {
                loader = loader.profile_name(profile);
            }
            if let Some(region) = &endpoint.region_name {
                loader = loader.region(Region::new(region.clone()));
            }
            if let (Some(key), Some(secret)) = (&endpoint.access_key_id, &endpoint.secret_access_key) {
                loader = loader.credentials_provider(Credentials::new(
                    key.clone(),
                    secret.clone(),
                    None,
                    None,
                    "cldcapt-config",
                ));
            }
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &remote.s3.endpoint {
            if let Some(url) = &endpoint.endpoint_url {
                builder = builder.endpoint_url(url).force_path_style(true);
            }
            if endpoint.verify == Some(false) {
                slog_scope::warn!(
                    "s3.endpoint.verify=false is not supported; certificates are always verified"
                );
            }
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: remote.s3.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Every key in the bucket, following continuation tokens to the end.
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(self.bucket.clone())
                .set_continuation_token(continuation_token)
                .send()
                .await
                .context("failed to list bucket objects")?;
            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            continuation_token = match response.next_continuation_token() {
                Some(token) => Some(token.to_string()),
                None => break,
            };
        }
        Ok(keys)
    }
}

fn spill_body(file: File) -> ByteStream {
    ByteStream::new(SdkBody::from_body_0_4(Body::wrap_stream(ReaderStream::new(file))))
}

#[async_trait]
impl ObjectStore for S3Service {
    async fn put_object(&self, key: &str, body: File, length: u64) -> Result<()> {
        self.client
            .put_object()
            .bucket(self.bucket.clone())
            .key(key)
            .content_length(length as i64)
            .body(spill_body(body))
            .send()
            .await
            .context("PutObject failed")?;
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> Result<String> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket.clone())
            .key(key)
            .send()
            .await
            .context("CreateMultipartUpload failed")?;
        response
            .upload_id()
            .map(|id| id.to_string())
            .context("CreateMultipartUpload returned no upload id")
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: File,
        length: u64,
    ) -> Result<String> {
        let response = self
            .client
            .upload_part()
            .bucket(self.bucket.clone())
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(length as i64)
            .body(spill_body(body))
            .send()
            .await
            .context("UploadPart failed")?;
        Ok(response.e_tag().unwrap_or_default().to_string())
    }

    async fn complete_multipart(&self, key: &str, upload_id: &str, parts: &[(i32, String)]) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|(number, etag)| {
                        CompletedPart::builder()
                            .part_number(*number)
                            .e_tag(etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(self.bucket.clone())
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .context("CompleteMultipartUpload failed")?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(self.bucket.clone())
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .context("AbortMultipartUpload failed")?;
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        for chunk in keys.chunks(MAX_KEYS_PER_DELETE) {
            let objects = chunk
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .context("failed to build object identifier")
                })
                .collect::<Result<Vec<_>>>()?;
            let response = self
                .client
                .delete_objects()
                .bucket(self.bucket.clone())
                .delete(
                    Delete::builder()
                        .set_objects(Some(objects))
                        .build()
                        .context("failed to build delete request")?,
                )
                .send()
                .await
                .context("DeleteObjects failed")?;
            for error in response.errors() {
                slog_scope::warn!(
                    "object deletion failed";
                    "key" => error.key().unwrap_or_default(),
                    "message" => error.message().unwrap_or_default()
                );
            }
        }
        Ok(())
    }
}

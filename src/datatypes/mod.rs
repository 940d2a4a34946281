pub mod camera_id;
pub mod rtsp_url;
